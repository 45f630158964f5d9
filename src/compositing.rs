//! Pixel operations behind matting and fusion
//!
//! Everything here is synchronous and CPU bound. The orchestrator runs these
//! functions on the blocking thread pool.

use crate::error::{FuseError, Result};
use crate::types::{AspectRatio, ColorMatch};
use image::{imageops, imageops::FilterType, DynamicImage, GenericImageView, ImageFormat, Rgb, Rgba, RgbaImage};
use palette::{FromColor, Lab, Srgb};
use std::io::Cursor;

/// Color used when an image has no opaque pixel to sample
const NEUTRAL_GREY: Rgb<u8> = Rgb([128, 128, 128]);

/// Histogram bins per channel for dominant color detection (16^3 = 4096 bins)
const BINS_PER_CHANNEL: usize = 16;

/// Decode an image from memory, detecting the format from content
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(FuseError::processing_stage_error("decode", "empty buffer", None));
    }
    image::load_from_memory(bytes).map_err(|e| {
        FuseError::processing_stage_error(
            "decode",
            &e.to_string(),
            Some(&format!("{} bytes", bytes.len())),
        )
    })
}

/// Encode as PNG, keeping the alpha channel
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)?;
    Ok(buffer)
}

/// MIME type guessed from magic bytes, `application/octet-stream` if unknown
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    image::guess_format(bytes).map_or("application/octet-stream", |f| f.to_mime_type())
}

/// Downscale so that neither side exceeds `max_side`; never enlarges
pub fn fit_within(image: &DynamicImage, max_side: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    if width <= max_side && height <= max_side {
        return image.clone();
    }
    log::debug!(
        "Downscaling {}x{} to fit within {}x{}",
        width,
        height,
        max_side,
        max_side
    );
    image.resize(max_side, max_side, FilterType::Lanczos3)
}

/// Composite `cutout` centered over a fully transparent canvas
///
/// A cutout larger than the canvas is cropped symmetrically.
pub fn center_on_canvas(cutout: &RgbaImage, width: u32, height: u32) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
    overlay_centered(&mut canvas, cutout);
    canvas
}

/// Alpha-composite `top` over `base` with their centers aligned
pub fn overlay_centered(base: &mut RgbaImage, top: &RgbaImage) {
    let x = (i64::from(base.width()) - i64::from(top.width())) / 2;
    let y = (i64::from(base.height()) - i64::from(top.height())) / 2;
    imageops::overlay(base, top, x, y);
}

/// Scale to cover `width x height` then center-crop to exactly that size
pub fn cover_fit(image: &DynamicImage, width: u32, height: u32) -> Result<RgbaImage> {
    if width == 0 || height == 0 {
        return Err(FuseError::processing_stage_error(
            "cover fit",
            "target size must be non-zero",
            Some(&format!("{}x{}", width, height)),
        ));
    }
    if image.dimensions() == (width, height) {
        return Ok(image.to_rgba8());
    }
    Ok(image
        .resize_to_fill(width, height, FilterType::Lanczos3)
        .to_rgba8())
}

/// Nearest multiple of `multiple`, never below `multiple`
pub fn round_to_multiple(value: u32, multiple: u32) -> u32 {
    let multiple = multiple.max(1);
    let rounded = (value.saturating_add(multiple / 2) / multiple) * multiple;
    rounded.max(multiple)
}

/// Smallest box with the requested ratio that still contains `width x height`
pub fn expand_to_aspect(width: u32, height: u32, ratio: AspectRatio) -> (u32, u32) {
    let (w, h) = (u64::from(width), u64::from(height));
    let (rw, rh) = (u64::from(ratio.width), u64::from(ratio.height));

    if w * rh >= h * rw {
        // wider than the ratio: grow the height
        let new_height = (w * rh).div_ceil(rw);
        (width, u32::try_from(new_height).unwrap_or(u32::MAX))
    } else {
        let new_width = (h * rw).div_ceil(rh);
        (u32::try_from(new_width).unwrap_or(u32::MAX), height)
    }
}

/// Scale dimensions down so the longest side is at most `max_side`
pub fn clamp_longest_side(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side || longest == 0 {
        return (width, height);
    }
    let scale = f64::from(max_side) / f64::from(longest);
    let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

/// Dimensions to request from the generator for a cutout of `width x height`
pub fn generation_size(
    width: u32,
    height: u32,
    aspect_ratio: Option<AspectRatio>,
    max_side: u32,
    multiple: u32,
) -> (u32, u32) {
    let (w, h) = match aspect_ratio {
        Some(ratio) => expand_to_aspect(width, height, ratio),
        None => (width, height),
    };
    let (w, h) = clamp_longest_side(w, h, max_side);
    (round_to_multiple(w, multiple), round_to_multiple(h, multiple))
}

/// Most frequent color in a 4096-bin RGB histogram, ignoring transparent pixels
///
/// The result is the center of the winning bin.
pub fn dominant_color(image: &RgbaImage) -> Rgb<u8> {
    let mut histogram = vec![0u32; BINS_PER_CHANNEL * BINS_PER_CHANNEL * BINS_PER_CHANNEL];
    let shift = 8 - BINS_PER_CHANNEL.trailing_zeros();

    for pixel in image.pixels() {
        let [r, g, b, a] = pixel.0;
        if a == 0 {
            continue;
        }
        let index = ((usize::from(r >> shift) * BINS_PER_CHANNEL) + usize::from(g >> shift))
            * BINS_PER_CHANNEL
            + usize::from(b >> shift);
        if let Some(count) = histogram.get_mut(index) {
            *count += 1;
        }
    }

    let mut best_index = None;
    let mut best_count = 0;
    for (index, &count) in histogram.iter().enumerate() {
        if count > best_count {
            best_count = count;
            best_index = Some(index);
        }
    }

    let Some(index) = best_index else {
        return NEUTRAL_GREY;
    };

    let bin_center = |bin: usize| ((bin << shift) | (1 << (shift - 1))) as u8;
    Rgb([
        bin_center(index / (BINS_PER_CHANNEL * BINS_PER_CHANNEL)),
        bin_center((index / BINS_PER_CHANNEL) % BINS_PER_CHANNEL),
        bin_center(index % BINS_PER_CHANNEL),
    ])
}

/// Keep each pixel's lightness but take its chroma from `color`
///
/// Works in CIE L*a*b* (D65). Alpha is left untouched.
pub fn tint(image: &RgbaImage, color: Rgb<u8>) -> RgbaImage {
    let chroma = to_lab(color.0);
    let mut output = image.clone();
    for pixel in output.pixels_mut() {
        let [r, g, b, a] = pixel.0;
        let lightness = to_lab([r, g, b]).l;
        let [nr, ng, nb] = from_lab(Lab::new(lightness, chroma.a, chroma.b));
        *pixel = Rgba([nr, ng, nb, a]);
    }
    output
}

fn to_lab([r, g, b]: [u8; 3]) -> Lab {
    Lab::from_color(Srgb::new(r, g, b).into_format::<f32>())
}

/// Back to 8-bit sRGB; out-of-gamut colors are clamped
fn from_lab(lab: Lab) -> [u8; 3] {
    let (r, g, b) = Srgb::<f32>::from_color(lab).into_format::<u8>().into_components();
    [r, g, b]
}

/// Soft-light blend `color` over every pixel, mixed in by `strength`
///
/// `strength` of 0 returns the image unchanged; mid grey is neutral at any
/// strength. Alpha is left untouched.
pub fn soft_light(image: &RgbaImage, color: Rgb<u8>, strength: f32) -> RgbaImage {
    let strength = strength.clamp(0.0, 1.0);
    let source = color.0.map(|c| f32::from(c) / 255.0);
    let mut output = image.clone();

    for pixel in output.pixels_mut() {
        let [r, g, b, a] = pixel.0;
        let mut channels = [r, g, b];
        for (channel, &cs) in channels.iter_mut().zip(source.iter()) {
            let cb = f32::from(*channel) / 255.0;
            let blended = soft_light_channel(cb, cs);
            let mixed = cb + strength * (blended - cb);
            *channel = (mixed * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgba([channels[0], channels[1], channels[2], a]);
    }
    output
}

/// W3C compositing soft-light for one normalized channel
fn soft_light_channel(cb: f32, cs: f32) -> f32 {
    if cs <= 0.5 {
        cb - (1.0 - 2.0 * cs) * cb * (1.0 - cb)
    } else {
        let d = if cb <= 0.25 {
            ((16.0 * cb - 12.0) * cb + 4.0) * cb
        } else {
            cb.sqrt()
        };
        cb + (2.0 * cs - 1.0) * (d - cb)
    }
}

/// Apply the configured color matching mode
pub fn apply_color_match(
    image: &RgbaImage,
    mode: ColorMatch,
    color: Rgb<u8>,
    strength: f32,
) -> RgbaImage {
    match mode {
        ColorMatch::None => image.clone(),
        ColorMatch::Tint => tint(image, color),
        ColorMatch::SoftLight => soft_light(image, color, strength),
    }
}

/// Parameters for a single fusion
#[derive(Debug, Clone, Copy)]
pub struct FusionParams {
    pub aspect_ratio: Option<AspectRatio>,
    pub color_match: ColorMatch,
    pub strength: f32,
    /// Longest side of the output canvas
    pub max_side: u32,
}

/// Result of `fuse_layers` with the values that drove it
#[derive(Debug)]
pub struct FusedImage {
    pub image: RgbaImage,
    pub dominant: Rgb<u8>,
}

/// Composite a cutout over a background
///
/// The output takes the cutout's size, expanded to `aspect_ratio` when one is
/// given. A canvas longer than `max_side` is scaled down together with the
/// cutout. The background is cover-fitted to the canvas, the cutout is
/// color-matched against the background's dominant color and centered on top.
pub fn fuse_layers(
    foreground: &DynamicImage,
    background: &DynamicImage,
    params: FusionParams,
) -> Result<FusedImage> {
    let (fg_width, fg_height) = foreground.dimensions();
    let (expanded_width, expanded_height) = match params.aspect_ratio {
        Some(ratio) => expand_to_aspect(fg_width, fg_height, ratio),
        None => (fg_width, fg_height),
    };
    let (width, height) = clamp_longest_side(expanded_width, expanded_height, params.max_side);

    let cutout = if (width, height) == (expanded_width, expanded_height) {
        foreground.to_rgba8()
    } else {
        let scale = f64::from(width.max(height)) / f64::from(expanded_width.max(expanded_height));
        let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).max(1);
        log::debug!(
            "Canvas {}x{} exceeds {} px, scaling by {:.3}",
            expanded_width,
            expanded_height,
            params.max_side,
            scale
        );
        foreground
            .resize_exact(scaled(fg_width), scaled(fg_height), FilterType::Lanczos3)
            .to_rgba8()
    };
    log::debug!(
        "Fusing {}x{} cutout onto {}x{} canvas ({})",
        fg_width,
        fg_height,
        width,
        height,
        params.color_match
    );

    let mut canvas = cover_fit(background, width, height)?;
    let dominant = dominant_color(&canvas);
    let matched = apply_color_match(
        &cutout,
        params.color_match,
        dominant,
        params.strength,
    );
    overlay_centered(&mut canvas, &matched);

    Ok(FusedImage {
        image: canvas,
        dominant,
    })
}
