//! Optional contrast enhancement applied before any detector call.
//!
//! Clip-limited tiled histogram equalization of the luminance channel (the
//! per-pixel luma gain is applied to all three channels), followed by gamma
//! correction. The caller treats any failure here as "use the raw image";
//! enhancement must never abort a request.

use anyhow::{bail, Result};
use image::RgbImage;

const TILE_GRID: usize = 8;
const CLIP_LIMIT: f32 = 2.0;
pub const DEFAULT_GAMMA: f32 = 1.4;

fn luma(pixel: &image::Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

/// Per-tile equalization lookup table.
fn tile_lut(histogram: &[u32; 256], pixels: u32) -> [u8; 256] {
    let mut identity = [0u8; 256];
    for (v, slot) in identity.iter_mut().enumerate() {
        *slot = v as u8;
    }
    if pixels == 0 {
        return identity;
    }

    // Clip the histogram and redistribute the excess uniformly.
    let limit = ((CLIP_LIMIT * pixels as f32 / 256.0).ceil() as u32).max(1);
    let mut clipped = *histogram;
    let mut excess = 0u32;
    for count in clipped.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }
    let bonus = excess / 256;
    for count in clipped.iter_mut() {
        *count += bonus;
    }

    let mut cdf = [0u32; 256];
    let mut running = 0u32;
    for (i, count) in clipped.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }
    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    let total = cdf[255];
    if total <= cdf_min {
        // Flat tile: equalization is a no-op.
        return identity;
    }

    let mut lut = [0u8; 256];
    for v in 0..256 {
        let scaled = (cdf[v].saturating_sub(cdf_min)) as f32 / (total - cdf_min) as f32;
        lut[v] = (scaled * 255.0).round() as u8;
    }
    lut
}

/// Enhance local contrast and apply gamma correction.
pub fn enhance(image: &RgbImage) -> Result<RgbImage> {
    enhance_with_gamma(image, DEFAULT_GAMMA)
}

pub fn enhance_with_gamma(image: &RgbImage, gamma: f32) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        bail!("cannot enhance an empty image");
    }
    if gamma <= 0.0 {
        bail!("gamma must be positive, got {gamma}");
    }

    let tile_w = (width as usize).div_ceil(TILE_GRID).max(1);
    let tile_h = (height as usize).div_ceil(TILE_GRID).max(1);

    // Per-tile luminance histograms.
    let mut histograms = vec![[0u32; 256]; TILE_GRID * TILE_GRID];
    let mut counts = vec![0u32; TILE_GRID * TILE_GRID];
    for (x, y, pixel) in image.enumerate_pixels() {
        let tx = (x as usize / tile_w).min(TILE_GRID - 1);
        let ty = (y as usize / tile_h).min(TILE_GRID - 1);
        histograms[ty * TILE_GRID + tx][luma(pixel) as usize] += 1;
        counts[ty * TILE_GRID + tx] += 1;
    }

    let luts: Vec<[u8; 256]> = histograms
        .iter()
        .zip(&counts)
        .map(|(hist, &count)| tile_lut(hist, count))
        .collect();

    // Gamma lookup shared by all channels.
    let inv_gamma = 1.0 / gamma;
    let mut gamma_lut = [0u8; 256];
    for (v, slot) in gamma_lut.iter_mut().enumerate() {
        *slot = ((v as f32 / 255.0).powf(inv_gamma) * 255.0).round().clamp(0.0, 255.0) as u8;
    }

    let mut output = RgbImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels() {
        let original = luma(pixel);

        // Bilinear interpolation between the four nearest tile mappings.
        let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
        let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let x0 = (fx.floor().max(0.0) as usize).min(TILE_GRID - 1);
        let y0 = (fy.floor().max(0.0) as usize).min(TILE_GRID - 1);
        let x1 = (x0 + 1).min(TILE_GRID - 1);
        let y1 = (y0 + 1).min(TILE_GRID - 1);
        let wx = (fx - x0 as f32).clamp(0.0, 1.0);
        let wy = (fy - y0 as f32).clamp(0.0, 1.0);

        let sample = |tx: usize, ty: usize| luts[ty * TILE_GRID + tx][original as usize] as f32;
        let top = sample(x0, y0) * (1.0 - wx) + sample(x1, y0) * wx;
        let bottom = sample(x0, y1) * (1.0 - wx) + sample(x1, y1) * wx;
        let equalized = top * (1.0 - wy) + bottom * wy;

        let gain = (equalized + 1.0) / (original as f32 + 1.0);
        let mut out = [0u8; 3];
        for (i, &channel) in pixel.0.iter().enumerate() {
            let boosted = (channel as f32 * gain).round().clamp(0.0, 255.0) as u8;
            out[i] = gamma_lut[boosted as usize];
        }
        output.put_pixel(x, y, image::Rgb(out));
    }

    Ok(output)
}
