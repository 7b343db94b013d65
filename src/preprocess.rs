//! Image to float tensor conversion.
//!
//! Images are scaled to fit the target size with their aspect ratio kept,
//! centred on a black canvas, then normalized per channel as
//! `(pixel - mean) / std` on the 0-255 scale. Output is RGB, either
//! interleaved (`HWC`) or planar (`CHW`).

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

use crate::error::Error;

/// Memory order of the produced tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    /// `RGBRGB...`, row by row.
    #[default]
    Hwc,
    /// All red values, then green, then blue.
    Chw,
}

impl Layout {
    pub fn from_raw(v: u32) -> Result<Self, Error> {
        match v {
            0 => Ok(Layout::Hwc),
            1 => Ok(Layout::Chw),
            other => Err(Error::InvalidArgument(format!("image layout {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    mean: [f32; 3],
    std: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }
}

impl Normalization {
    /// Every standard deviation must be finite and non-zero.
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Result<Self, Error> {
        if std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(Error::InvalidArgument(format!(
                "standard deviations must be finite and non-zero, got {std:?}"
            )));
        }
        Ok(Self { mean, std })
    }

    pub fn mean(&self) -> [f32; 3] {
        self.mean
    }

    pub fn std(&self) -> [f32; 3] {
        self.std
    }

    fn apply(&self, channel: usize, value: u8) -> f32 {
        (value as f32 - self.mean[channel]) / self.std[channel]
    }
}

/// Where the scaled image sits on the canvas, for mapping results back to
/// source coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_left: u32,
    pub pad_top: u32,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    normalization: Normalization,
    layout: Layout,
    filter: FilterType,
}

impl Preprocessor {
    pub fn new(width: u32, height: u32) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument(format!(
                "target size {width}x{height} is empty"
            )));
        }
        Ok(Self {
            width,
            height,
            normalization: Normalization::default(),
            layout: Layout::default(),
            filter: FilterType::Triangle,
        })
    }

    pub fn normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }

    /// Number of floats produced per image.
    pub fn output_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn letterbox(&self, img: &DynamicImage) -> (RgbImage, Letterbox) {
        let (ow, oh) = (img.width().max(1), img.height().max(1));
        let scale = (self.width as f32 / ow as f32).min(self.height as f32 / oh as f32);
        let nw = ((ow as f32 * scale).round() as u32).clamp(1, self.width);
        let nh = ((oh as f32 * scale).round() as u32).clamp(1, self.height);

        let rgb = img.to_rgb8();
        let resized = if (nw, nh) == (rgb.width(), rgb.height()) {
            rgb
        } else {
            imageops::resize(&rgb, nw, nh, self.filter)
        };

        let pad_left = (self.width - nw) / 2;
        let pad_top = (self.height - nh) / 2;
        let mut canvas = RgbImage::new(self.width, self.height);
        imageops::replace(&mut canvas, &resized, pad_left as i64, pad_top as i64);
        (
            canvas,
            Letterbox {
                scale,
                pad_left,
                pad_top,
            },
        )
    }

    /// Normalize an image that already has the target size.
    pub fn to_tensor(&self, rgb: &RgbImage) -> Vec<f32> {
        let norm = &self.normalization;
        let mut out = Vec::with_capacity(rgb.len());
        match self.layout {
            Layout::Hwc => {
                for px in rgb.pixels() {
                    for c in 0..3 {
                        out.push(norm.apply(c, px[c]));
                    }
                }
            }
            Layout::Chw => {
                for c in 0..3 {
                    out.extend(rgb.pixels().map(|px| norm.apply(c, px[c])));
                }
            }
        }
        out
    }

    pub fn run(&self, img: &DynamicImage) -> (Vec<f32>, Letterbox) {
        let (canvas, letterbox) = self.letterbox(img);
        (self.to_tensor(&canvas), letterbox)
    }

    pub fn run_file(&self, path: &Path) -> Result<Vec<f32>, Error> {
        let img = image::open(path)
            .map_err(|e| Error::Image(format!("{}: {e}", path.display())))?;
        Ok(self.run(&img).0)
    }

    pub fn run_bytes(&self, bytes: &[u8]) -> Result<Vec<f32>, Error> {
        let img = image::load_from_memory(bytes).map_err(|e| Error::Image(e.to_string()))?;
        Ok(self.run(&img).0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn red(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 0, 0])))
    }

    fn unit() -> Normalization {
        Normalization::new([0.0; 3], [255.0; 3]).unwrap()
    }

    #[test]
    fn wide_image_is_padded_top_and_bottom() {
        let p = Preprocessor::new(4, 4).unwrap().normalization(unit());
        let (data, lb) = p.run(&red(4, 2));
        assert_eq!(lb, Letterbox { scale: 1.0, pad_left: 0, pad_top: 1 });
        assert_eq!(data.len(), p.output_len());
        // row 0 is padding, row 1 is image
        assert_eq!(&data[0..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&data[12..15], &[1.0, 0.0, 0.0]);
        assert_eq!(&data[36..39], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn planar_layout() {
        let p = Preprocessor::new(4, 4)
            .unwrap()
            .normalization(unit())
            .layout(Layout::Chw);
        let (data, _) = p.run(&red(4, 2));
        let plane = 16;
        assert_eq!(data[4], 1.0);
        assert_eq!(data[0], 0.0);
        assert!(data[plane..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn tall_image_is_scaled_and_centred() {
        let p = Preprocessor::new(8, 8).unwrap().filter(FilterType::Nearest);
        let (canvas, lb) = p.letterbox(&red(2, 4));
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.pad_left, lb.pad_top), (2, 0));
        assert_eq!(canvas.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(canvas.get_pixel(2, 0), &Rgb([255, 0, 0]));
        assert_eq!(canvas.get_pixel(5, 7), &Rgb([255, 0, 0]));
        assert_eq!(canvas.get_pixel(6, 7), &Rgb([0, 0, 0]));
    }

    #[test]
    fn mean_and_std_apply_per_channel() {
        let norm = Normalization::new([128.0, 0.0, 10.0], [2.0, 1.0, 5.0]).unwrap();
        let p = Preprocessor::new(1, 1).unwrap().normalization(norm);
        let (data, _) = p.run(&red(1, 1));
        assert_eq!(data, vec![63.5, 0.0, -2.0]);
    }

    #[test]
    fn zero_std_is_rejected() {
        assert!(Normalization::new([0.0; 3], [1.0, 0.0, 1.0]).is_err());
        assert!(Preprocessor::new(0, 4).is_err());
        assert!(Layout::from_raw(2).is_err());
    }

    #[test]
    fn decodes_png_from_disk_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        red(2, 2).save(&path).unwrap();
        let p = Preprocessor::new(2, 2).unwrap().normalization(unit());
        let from_file = p.run_file(&path).unwrap();
        let from_bytes = p.run_bytes(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(from_file, from_bytes);
        assert_eq!(&from_file[..3], &[1.0, 0.0, 0.0]);

        assert!(matches!(p.run_file(&dir.path().join("missing.png")), Err(Error::Image(_))));
        assert!(matches!(p.run_bytes(b"not an image"), Err(Error::Image(_))));
    }
}
