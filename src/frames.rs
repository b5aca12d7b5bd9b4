//! Frame loading and density map export.
use std::path::{Path, PathBuf};

use image::imageops::FilterType::Lanczos3;
use image::{GrayImage, Luma};
use ndarray::{Array3, ArrayD};
use tch::{Device, Kind, Tensor};
use walkdir::WalkDir;

use crate::error::{Error, Result};

const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];
const EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Returns a normalized `(3, H, W)` float tensor, resized to `size`
/// (width, height) when given.
pub fn load_frame(path: impl AsRef<Path>, size: Option<(u32, u32)>) -> Result<Tensor> {
    let mut img = image::open(path)?;
    if let Some((w, h)) = size {
        img = img.resize_exact(w, h, Lanczos3);
    }
    let img = img.to_rgb8();
    let (w, h) = img.dimensions();
    let mut data: Array3<f32> = Array3::zeros((3, h as usize, w as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            data[[c, y as usize, x as usize]] = (pixel[c] as f32 / 255. - MEAN[c]) / STD[c];
        }
    }
    let frame: Tensor = data.try_into()?;
    Ok(frame)
}

/// Loads frames as `(1, 3, H, W)` batches on `device`, keeping the most
/// recent one so a frame shared by two consecutive pairs is decoded once.
pub struct FrameCache {
    size: Option<(u32, u32)>,
    device: Device,
    last: Option<(PathBuf, Tensor)>,
    decoded: usize,
}

impl FrameCache {
    pub fn new(size: Option<(u32, u32)>, device: Device) -> Self {
        Self {
            size,
            device,
            last: None,
            decoded: 0,
        }
    }

    pub fn load(&mut self, path: &Path) -> Result<Tensor> {
        if let Some((cached, frame)) = &self.last {
            if cached == path {
                return Ok(frame.shallow_clone());
            }
        }
        let frame = load_frame(path, self.size)?
            .unsqueeze(0)
            .to_device(self.device);
        self.decoded += 1;
        self.last = Some((path.to_path_buf(), frame.shallow_clone()));
        Ok(frame)
    }

    /// Number of image files read so far.
    pub fn decoded(&self) -> usize {
        self.decoded
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| {
            EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Consecutive `(previous, current)` pairs of the image files directly in
/// `dir`, ordered by file name.
pub fn frame_pairs(dir: impl AsRef<Path>) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut frames = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && is_image(entry.path()) {
            frames.push(entry.into_path());
        }
    }
    Ok(frames
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

/// Min-max scaled grayscale rendering of a `(C, H, W)` density map; the
/// channels are summed first.
pub fn density_to_image(density: &Tensor) -> Result<GrayImage> {
    let size = density.size();
    if size.len() != 3 {
        return Err(Error::Rank {
            op: "density image",
            expected: 3,
            shape: size,
        });
    }
    let (h, w) = (size[1], size[2]);
    let map = density
        .sum_dim_intlist(&[0i64][..], false, Kind::Float)
        .to_device(Device::Cpu);
    let map: ArrayD<f32> = (&map).try_into()?;
    let (lo, hi) = map
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let scale = if hi > lo { 255. / (hi - lo) } else { 0. };
    Ok(GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let v = map[[y as usize, x as usize]];
        Luma([((v - lo) * scale).round() as u8])
    }))
}
