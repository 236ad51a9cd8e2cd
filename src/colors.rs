//! Region color descriptors.
//!
//! Pure-black pixels are treated as a masked-out sentinel rather than a real
//! sample, so letterbox padding and mask background never drag the mean
//! towards black. Every function here degrades to the zero color instead of
//! failing; color extraction is never allowed to abort a request.

use image::RgbImage;

pub type Rgb = [u8; 3];

pub const BLACK: Rgb = [0, 0, 0];

/// Mean color of a region, excluding pure-black pixels. All-black or empty
/// regions yield black. Channel means are truncated to integers.
pub fn dominant_color(region: &RgbImage) -> Rgb {
    let mut sums = [0u64; 3];
    let mut count = 0u64;

    for pixel in region.pixels() {
        if pixel.0 == BLACK {
            continue;
        }
        sums[0] += pixel.0[0] as u64;
        sums[1] += pixel.0[1] as u64;
        sums[2] += pixel.0[2] as u64;
        count += 1;
    }

    if count == 0 {
        return BLACK;
    }
    [
        (sums[0] / count) as u8,
        (sums[1] / count) as u8,
        (sums[2] / count) as u8,
    ]
}

/// Per-channel complement. Involutive.
pub fn complementary_color(rgb: Rgb) -> Rgb {
    [255 - rgb[0], 255 - rgb[1], 255 - rgb[2]]
}

/// Mean over the concatenated pixels of all non-empty regions. Black pixels
/// count here, unlike [`dominant_color`]; this averages whole crops.
/// Empty input, or input with only empty regions, yields black.
pub fn average_color(regions: &[RgbImage]) -> Rgb {
    let mut sums = [0u64; 3];
    let mut count = 0u64;

    for region in regions {
        for pixel in region.pixels() {
            sums[0] += pixel.0[0] as u64;
            sums[1] += pixel.0[1] as u64;
            sums[2] += pixel.0[2] as u64;
            count += 1;
        }
    }

    if count == 0 {
        return BLACK;
    }
    [
        (sums[0] / count) as u8,
        (sums[1] / count) as u8,
        (sums[2] / count) as u8,
    ]
}

/// Dominant color over the union of the given rectangles.
///
/// The union is a boolean mask, so overlapping boxes are counted once; this
/// is deliberately not a mean of per-box means, which would double-weight
/// large or overlapping boxes.
pub fn combined_region_color(image: &RgbImage, boxes: &[[i64; 4]]) -> Rgb {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return BLACK;
    }

    let mut mask = vec![false; (width as usize) * (height as usize)];
    for bbox in boxes {
        let x1 = bbox[0].clamp(0, width as i64) as usize;
        let y1 = bbox[1].clamp(0, height as i64) as usize;
        let x2 = bbox[2].clamp(0, width as i64) as usize;
        let y2 = bbox[3].clamp(0, height as i64) as usize;
        for y in y1..y2 {
            let row = y * width as usize;
            for x in x1..x2 {
                mask[row + x] = true;
            }
        }
    }

    let mut sums = [0u64; 3];
    let mut count = 0u64;
    for (i, pixel) in image.pixels().enumerate() {
        if !mask[i] || pixel.0 == BLACK {
            continue;
        }
        sums[0] += pixel.0[0] as u64;
        sums[1] += pixel.0[1] as u64;
        sums[2] += pixel.0[2] as u64;
        count += 1;
    }

    if count == 0 {
        return BLACK;
    }
    [
        (sums[0] / count) as u8,
        (sums[1] / count) as u8,
        (sums[2] / count) as u8,
    ]
}
