use anyhow::{anyhow, Result};
use ndarray::Array3;
use opencv::core::{Mat, Size, Vector};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};

pub const CHANNELS: usize = 3;

/// Copy a BGR `Mat` into an owned HWC pixel buffer.
pub fn mat_to_array3(mat: &Mat) -> Result<Array3<u8>> {
    let rows = mat.rows();
    let cols = mat.cols();
    if rows <= 0 || cols <= 0 {
        return Err(anyhow!("empty frame"));
    }
    let owned;
    let continuous = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone()?;
        &owned
    };
    let data = continuous.data_bytes()?.to_vec();
    Ok(Array3::from_shape_vec((rows as usize, cols as usize, CHANNELS), data)?)
}

/// Shrink so both dimensions fit within (max_h, max_w), preserving aspect.
/// Returns the applied scale (1.0 when untouched).
pub fn downscale_to_fit(mat: &Mat, max_h: u32, max_w: u32) -> Result<(Mat, f64)> {
    let h = mat.rows() as f64;
    let w = mat.cols() as f64;
    if h <= max_h as f64 && w <= max_w as f64 {
        return Ok((mat.try_clone()?, 1.0));
    }
    let scale = (max_h as f64 / h).min(max_w as f64 / w);
    let mut out = Mat::default();
    imgproc::resize(
        mat,
        &mut out,
        Size::new((w * scale) as i32, (h * scale) as i32),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;
    Ok((out, scale))
}

/// Resize to the given width, preserving aspect ratio.
pub fn resize_to_width(mat: &Mat, width: u32) -> Result<Mat> {
    let w = mat.cols();
    let h = mat.rows();
    if w <= 0 || h <= 0 || w as u32 == width {
        return Ok(mat.try_clone()?);
    }
    let out_h = ((h as f64) * (width as f64) / (w as f64)).round().max(1.0) as i32;
    let mut out = Mat::default();
    imgproc::resize(
        mat,
        &mut out,
        Size::new(width as i32, out_h),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;
    Ok(out)
}

pub fn write_jpeg(path: &std::path::Path, mat: &Mat, quality: i32) -> Result<()> {
    let params = Vector::<i32>::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, quality.clamp(1, 100)]);
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("non-utf8 snapshot path: {}", path.display()))?;
    if !imgcodecs::imwrite(path_str, mat, &params)? {
        return Err(anyhow!("jpeg encode failed for {}", path.display()));
    }
    Ok(())
}
