//! Face region extraction.
//!
//! Cuts a detected face out of its source image with a fixed margin so the
//! embedding network sees some context around the face box.

use crate::types::{FaceRegion, Image};

/// Margin added on every side of a face region, in pixels.
pub const ALIGN_PADDING: u32 = 10;

/// Padded sub-image for `region`, clamped to the image bounds.
///
/// Returns `None` when the region does not lie inside `image`; that face is
/// treated as unalignable, not as a fatal error.
pub fn extract_region(image: &Image, region: &FaceRegion) -> Option<Image> {
    if !region.fits(image.width(), image.height()) {
        tracing::warn!(
            ?region,
            width = image.width(),
            height = image.height(),
            "face region outside image bounds; cannot align"
        );
        return None;
    }

    let top = region.top.saturating_sub(ALIGN_PADDING);
    let left = region.left.saturating_sub(ALIGN_PADDING);
    let bottom = region.bottom.saturating_add(ALIGN_PADDING).min(image.height());
    let right = region.right.saturating_add(ALIGN_PADDING).min(image.width());

    image.crop(top, left, bottom, right)
}
