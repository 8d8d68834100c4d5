use image::imageops;

use crate::frame::Frame;

/// Uniformly shrink `frame` so that its largest side is at most `target_max`.
///
/// The aspect ratio is preserved and frames that already fit are returned
/// unchanged; this never upscales. Shrinking averages the source area under
/// each output pixel.
pub fn scale_for_display(frame: &Frame, target_max: u32) -> Frame {
    let (width, height) = frame.dimensions();
    let largest = width.max(height);
    let target_max = target_max.max(1);
    if largest <= target_max {
        return frame.clone();
    }

    let scale = (target_max as f64 / largest as f64).min(1.0);
    let shrink = |side: u32| ((side as f64 * scale).round() as u32).clamp(1, target_max);
    imageops::thumbnail(frame, shrink(width), shrink(height))
}
