//! Four-panel summary image returned with every prediction.
//!
//! Layout, in reading order: "CNN" (the masked classifier input), "Original",
//! "Segmentation" (mask painted in the highlight colour) and "Combined".
//! "Combined" currently shows the original image again.

use crate::config::VisualizationSettings;
use crate::pipeline::{InferenceOutcome, SegmentationMask};
use crate::preprocess::PreprocessedImage;
use ab_glyph::{FontVec, PxScale};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use ndarray::Array3;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

pub const PANEL_TITLES: [&str; 4] = ["CNN", "Original", "Segmentation", "Combined"];
pub const DATA_URI_PREFIX: &str = "data:image/png;base64,";

const MARGIN: u32 = 16;
const BACKGROUND_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

const SYSTEM_FONTS: [&str; 5] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Clone)]
pub struct PanelRenderer {
    panel_size: u32,
    highlight: Rgb<u8>,
    title_scale: f32,
    font: Option<Arc<FontVec>>,
}

impl PanelRenderer {
    pub fn new(settings: &VisualizationSettings) -> Self {
        let font = settings
            .font_path
            .as_deref()
            .and_then(load_font)
            .or_else(|| SYSTEM_FONTS.iter().find_map(|path| load_font(Path::new(path))));
        if font.is_none() {
            log::warn!("No title font found, panel titles will be skipped");
        }
        Self::with_font(settings, font)
    }

    pub fn with_font(settings: &VisualizationSettings, font: Option<FontVec>) -> Self {
        Self {
            panel_size: settings.panel_size,
            highlight: Rgb(settings.highlight_color),
            title_scale: settings.title_scale,
            font: font.map(Arc::new),
        }
    }

    fn title_height(&self) -> u32 {
        (self.title_scale * 1.6).ceil() as u32
    }

    pub fn canvas_dimensions(&self) -> (u32, u32) {
        let width = 2 * self.panel_size + 3 * MARGIN;
        let height = 2 * (self.panel_size + self.title_height()) + 3 * MARGIN;
        (width, height)
    }

    pub fn render(&self, image: &PreprocessedImage, outcome: &InferenceOutcome) -> RgbImage {
        let masked = tensor_to_display(&outcome.masked);
        let overlay = highlight_mask(&image.display, &outcome.mask, self.highlight);
        let panels = [&masked, &image.display, &overlay, &image.display];

        let (width, height) = self.canvas_dimensions();
        let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND_COLOR);
        for (i, (panel, title)) in panels.iter().zip(PANEL_TITLES).enumerate() {
            let col = (i % 2) as u32;
            let row = (i / 2) as u32;
            let x = MARGIN + col * (self.panel_size + MARGIN);
            let y = MARGIN + row * (self.panel_size + self.title_height() + MARGIN);
            self.draw_title(&mut canvas, title, x, y);

            let size = self.panel_size;
            let scaled = imageops::resize(*panel, size, size, FilterType::Nearest);
            let top = y + self.title_height();
            imageops::replace(&mut canvas, &scaled, i64::from(x), i64::from(top));
        }
        canvas
    }

    fn draw_title(&self, canvas: &mut RgbImage, title: &str, x: u32, y: u32) {
        let Some(font) = self.font.as_deref() else {
            return;
        };
        let scale = PxScale::from(self.title_scale);
        let (text_width, _) = text_size(scale, font, title);
        let offset = self.panel_size.saturating_sub(text_width) / 2;
        draw_text_mut(canvas, TEXT_COLOR, (x + offset) as i32, y as i32, scale, font, title);
    }
}

fn load_font(path: &Path) -> Option<FontVec> {
    let data = std::fs::read(path).ok()?;
    match FontVec::try_from_vec(data) {
        Ok(font) => {
            log::info!("Loaded title font: {}", path.display());
            Some(font)
        }
        Err(_) => {
            log::warn!("Failed to parse font file: {}", path.display());
            None
        }
    }
}

/// BGR [0, 1] tensor back to an RGB raster.
fn tensor_to_display(tensor: &Array3<f32>) -> RgbImage {
    let (h, w, _) = tensor.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let channel = |c: usize| (tensor[[y, x, c]].clamp(0.0, 1.0) * 255.0).round() as u8;
        Rgb([channel(2), channel(1), channel(0)])
    })
}

fn highlight_mask(display: &RgbImage, mask: &SegmentationMask, color: Rgb<u8>) -> RgbImage {
    let mut overlay = display.clone();
    for (x, y, pixel) in overlay.enumerate_pixels_mut() {
        if mask.is_set(y as usize, x as usize) {
            *pixel = color;
        }
    }
    overlay
}

pub fn encode_data_uri(canvas: &RgbImage) -> Result<String, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    canvas.write_to(&mut buf, ImageFormat::Png)?;
    Ok(format!("{}{}", DATA_URI_PREFIX, STANDARD.encode(buf.into_inner())))
}
