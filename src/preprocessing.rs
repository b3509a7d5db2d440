use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array, Array3, Ix4};

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Model-ready tensors for one image.
pub struct ImageTensor {
    pub pixel_values: Array<f32, Ix4>,
    pub pixel_mask: Array3<i64>,
    pub orig_width: u32,
    pub orig_height: u32,
}

/// Target `(width, height)`: the shorter side becomes `shorter`, unless the
/// longer side would then exceed `max_size`.
pub fn target_size(width: u32, height: u32, shorter: u32, max_size: u32) -> (u32, u32) {
    let (min_side, max_side) = if width < height {
        (width as f32, height as f32)
    } else {
        (height as f32, width as f32)
    };

    let mut size = shorter as f32;
    if max_side / min_side * size > max_size as f32 {
        size = (max_size as f32 * min_side / max_side).round_ties_even();
    }

    let scaled = |side: f32, other: f32| ((size * side / other) as u32).max(1);
    if width < height {
        (size as u32, scaled(height as f32, width as f32))
    } else {
        (scaled(width as f32, height as f32), size as u32)
    }
}

pub fn transform_image(image: &DynamicImage, shorter: u32, max_size: u32) -> ImageTensor {
    let (orig_width, orig_height) = image.dimensions();
    let (width, height) = target_size(orig_width, orig_height, shorter, max_size);

    let rgb = image
        .resize_exact(width, height, FilterType::CatmullRom)
        .to_rgb8();

    let mut pixel_values = Array::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            pixel_values[[0, c, y, x]] = (pixel[c] as f32 / 255. - MEAN[c]) / STD[c];
        }
    }

    ImageTensor {
        pixel_values,
        pixel_mask: Array3::ones((1, height as usize, width as usize)),
        orig_width,
        orig_height,
    }
}
