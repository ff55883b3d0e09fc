use image::{
    imageops::{self, FilterType},
    RgbImage,
};
use rand::Rng;

const CROP_SCALE: (f64, f64) = (0.08, 1.0);
const CROP_RATIO: (f64, f64) = (3. / 4., 4. / 3.);
const CROP_ATTEMPTS: usize = 10;

/// Per-split image pipeline, applied to every decoded image before batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Random resized crop followed by a random horizontal flip.
    Train,
    /// Plain resize to the network input size.
    Eval,
}

impl Transform {
    pub fn apply<R: Rng>(&self, image: &RgbImage, size: u32, rng: &mut R) -> RgbImage {
        match self {
            Transform::Train => {
                let image = random_resized_crop(image, size, rng);
                if rng.gen_bool(0.5) {
                    imageops::flip_horizontal(&image)
                } else {
                    image
                }
            }
            Transform::Eval => imageops::resize(image, size, size, FilterType::Triangle),
        }
    }
}

/// Crops a random region covering 8%..100% of the area with an aspect ratio in
/// 3/4..4/3, then resizes it to `size` x `size`.
pub fn random_resized_crop<R: Rng>(image: &RgbImage, size: u32, rng: &mut R) -> RgbImage {
    let (x, y, width, height) = crop_region(image.width(), image.height(), rng);
    let crop = imageops::crop_imm(image, x, y, width, height).to_image();

    imageops::resize(&crop, size, size, FilterType::Triangle)
}

fn crop_region<R: Rng>(width: u32, height: u32, rng: &mut R) -> (u32, u32, u32, u32) {
    let area = width as f64 * height as f64;
    let log_ratio = (CROP_RATIO.0.ln(), CROP_RATIO.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * rng.gen_range(CROP_SCALE.0..=CROP_SCALE.1);
        let aspect_ratio = rng.gen_range(log_ratio.0..=log_ratio.1).exp();

        let crop_width = (target_area * aspect_ratio).sqrt().round() as u32;
        let crop_height = (target_area / aspect_ratio).sqrt().round() as u32;

        if 0 < crop_width && crop_width <= width && 0 < crop_height && crop_height <= height {
            let x = rng.gen_range(0..=width - crop_width);
            let y = rng.gen_range(0..=height - crop_height);
            return (x, y, crop_width, crop_height);
        }
    }

    // Fall back to the largest centered crop with a ratio inside the bounds.
    let in_ratio = width as f64 / height as f64;
    let (crop_width, crop_height) = if in_ratio < CROP_RATIO.0 {
        (width, ((width as f64 / CROP_RATIO.0).round() as u32).min(height))
    } else if in_ratio > CROP_RATIO.1 {
        (((height as f64 * CROP_RATIO.1).round() as u32).min(width), height)
    } else {
        (width, height)
    };

    (
        (width - crop_width) / 2,
        (height - crop_height) / 2,
        crop_width,
        crop_height,
    )
}

/// Flattens an RGB image into channel-major (`CHW`) order.
pub fn to_chw(image: &RgbImage) -> Vec<u8> {
    let plane = (image.width() * image.height()) as usize;
    let mut pixels = vec![0; plane * 3];

    for (i, pixel) in image.pixels().enumerate() {
        let [r, g, b] = pixel.0;
        pixels[i] = r;
        pixels[plane + i] = g;
        pixels[2 * plane + i] = b;
    }

    pixels
}

#[cfg(test)]
mod tests {
    use image::Rgb;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn train_transform_always_yields_square_output() {
        let mut rng = StdRng::seed_from_u64(7);

        for (width, height) in [(320, 240), (50, 400), (400, 50), (16, 16), (1, 1)] {
            let image = RgbImage::from_pixel(width, height, Rgb([10, 20, 30]));
            let out = Transform::Train.apply(&image, 24, &mut rng);
            assert_eq!(out.dimensions(), (24, 24), "input {width}x{height}");
        }
    }

    #[test]
    fn eval_transform_resizes_exactly() {
        let image = RgbImage::from_pixel(300, 200, Rgb([1, 2, 3]));
        let out = Transform::Eval.apply(&image, 32, &mut StdRng::seed_from_u64(0));

        assert_eq!(out.dimensions(), (32, 32));
        assert_eq!(out.get_pixel(5, 5), &Rgb([1, 2, 3]));
    }

    #[test]
    fn crop_region_stays_inside_image() {
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let (x, y, w, h) = crop_region(120, 80, &mut rng);
            assert!(w > 0 && h > 0);
            assert!(x + w <= 120);
            assert!(y + h <= 80);
        }
    }

    #[test]
    fn chw_layout_splits_channels_into_planes() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([1, 2, 3]));
        image.put_pixel(1, 0, Rgb([4, 5, 6]));

        assert_eq!(to_chw(&image), vec![1, 4, 2, 5, 3, 6]);
    }
}
