use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageDecoder, ImageError, ImageReader, ImageResult, RgbImage};
use tch::Tensor;

pub const INPUT_SIZE: u32 = 224;
pub const RESIZE_SHORT_SIDE: u32 = 256;

// Normalization constants the checkpoint was trained under. Changing either
// silently degrades accuracy instead of failing.
pub const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode raw image bytes into 3-channel RGB, honouring EXIF orientation so
/// the stored and visual orientations match.
pub fn decode_rgb(bytes: &[u8]) -> ImageResult<RgbImage> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(ImageError::IoError)?;
    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image.to_rgb8())
}

/// Gray-world white balance: rescale each channel so the per-channel means
/// converge on their common average. Idempotent on neutral-gray input.
pub fn gray_world(image: &RgbImage) -> RgbImage {
    let pixel_count = f64::from(image.width()) * f64::from(image.height());
    let mut sums = [0.0f64; 3];
    for pixel in image.pixels() {
        for c in 0..3 {
            sums[c] += f64::from(pixel[c]);
        }
    }
    let means = sums.map(|sum| (sum / pixel_count) as f32 + 1e-6);
    let target = (means[0] + means[1] + means[2]) / 3.0;

    let mut balanced = image.clone();
    for pixel in balanced.pixels_mut() {
        for c in 0..3 {
            let scaled = f32::from(pixel[c]) * (target / means[c]);
            pixel[c] = scaled.clamp(0.0, 255.0) as u8;
        }
    }
    balanced
}

fn resize_short_side(image: &RgbImage, target: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = if width <= height {
        let scaled = (f64::from(height) * f64::from(target) / f64::from(width)).round() as u32;
        (target, scaled.max(target))
    } else {
        let scaled = (f64::from(width) * f64::from(target) / f64::from(height)).round() as u32;
        (scaled.max(target), target)
    };
    imageops::resize(image, new_width, new_height, FilterType::Triangle)
}

fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let x = (width - size) / 2;
    let y = (height - size) / 2;
    imageops::crop_imm(image, x, y, size, size).to_image()
}

/// Fixed tensor pipeline: gray-world balance, resize the short side to 256,
/// center-crop 224, scale to [0,1], normalize per channel. Returns a
/// `[3, 224, 224]` float tensor; the caller adds the batch dimension.
pub fn pipeline(image: &RgbImage) -> Tensor {
    let balanced = gray_world(image);
    let resized = resize_short_side(&balanced, RESIZE_SHORT_SIDE);
    let cropped = center_crop(&resized, INPUT_SIZE);

    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in cropped.enumerate_pixels() {
        let offset = (y * INPUT_SIZE + x) as usize;
        for c in 0..3 {
            let value = f32::from(pixel[c]) / 255.0;
            data[c * plane + offset] = (value - CHANNEL_MEAN[c]) / CHANNEL_STD[c];
        }
    }
    Tensor::from_slice(&data).view([3, i64::from(INPUT_SIZE), i64::from(INPUT_SIZE)])
}
