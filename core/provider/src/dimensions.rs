use atelier_model::{AspectRatio, ImageSize};

/// Concrete pixel dimensions for an aspect ratio and resolution class.
/// The longer edge takes the class size; alignment to 8 is the single
/// final step so no adapter duplicates the math.
pub fn resolve(ratio: AspectRatio, size: ImageSize) -> (u32, u32) {
    let long = size.long_edge();
    let (rw, rh) = ratio.proportions();
    let (width, height) = if rw >= rh {
        (long, long * rh / rw)
    } else {
        (long * rw / rh, long)
    };
    (align8(width), align8(height))
}

fn align8(value: u32) -> u32 {
    std::cmp::max(8, value / 8 * 8)
}
