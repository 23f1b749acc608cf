use crate::error::PredictError;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageReader, RgbImage};
use ndarray::{Array3, ArrayView4, Axis};
use std::path::Path;

/// A decoded upload resized to the model resolution.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    /// `(H, W, 3)` in BGR channel order, scaled to [0, 1].
    pub tensor: Array3<f32>,
    /// RGB copy at the same resolution, not normalized. Used only for rendering.
    pub display: RgbImage,
}

impl PreprocessedImage {
    pub fn batched(&self) -> ArrayView4<'_, f32> {
        self.tensor.view().insert_axis(Axis(0))
    }

    pub fn dimensions(&self) -> (usize, usize) {
        let (h, w, _) = self.tensor.dim();
        (h, w)
    }
}

pub fn load(path: &Path, size: u32) -> Result<PreprocessedImage, PredictError> {
    let unreadable = |reason: String| {
        log::error!("Failed to decode {}: {}", path.display(), reason);
        PredictError::UnreadableImage(path.display().to_string())
    };
    let image = ImageReader::open(path)
        .map_err(|e| unreadable(e.to_string()))?
        .with_guessed_format()
        .map_err(|e| unreadable(e.to_string()))?
        .decode()
        .map_err(|e| unreadable(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(unreadable("image has no pixels".to_string()));
    }
    Ok(prepare(&image, size))
}

pub fn prepare(image: &DynamicImage, size: u32) -> PreprocessedImage {
    let display = imageops::resize(&image.to_rgb8(), size, size, FilterType::Triangle);
    let side = size as usize;
    let tensor = Array3::from_shape_fn((side, side, 3), |(y, x, c)| {
        let pixel = display.get_pixel(x as u32, y as u32);
        f32::from(pixel[2 - c]) / 255.0
    });
    PreprocessedImage { tensor, display }
}
