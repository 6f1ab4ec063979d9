use crate::calibration::{pinhole_normalize, Calibration, NewCameraMatrix};
use crate::error::{PipelineError, Result};
use crate::utils::{list_files_with_ext, write_atomic};
use image::{DynamicImage, ImageBuffer, ImageFormat, Pixel};
use std::io::Cursor;
use std::path::Path;

/// Source coordinates to sample for every output pixel.
pub struct UndistortMap {
    width: u32,
    height: u32,
    coords: Vec<(f32, f32)>,
}

impl UndistortMap {
    /// Build the remap table for frames of `width` x `height`. Output pixels
    /// are laid out by the camera matrix `strategy` picks.
    pub fn new(calibration: &Calibration, strategy: NewCameraMatrix, width: u32, height: u32) -> Self {
        let k = calibration.scaled_to(width, height);
        let new_k = calibration.new_camera_matrix(strategy, width, height);
        let (fx, fy, cx, cy, skew) = (k.fx(), k.fy(), k.cx(), k.cy(), k.skew());
        let mut coords = Vec::with_capacity(width as usize * height as usize);
        for v in 0..height {
            for u in 0..width {
                let (x, y) = pinhole_normalize(&new_k, u as f64, v as f64);
                let (xd, yd) = k.distort(x, y);
                coords.push(((fx * xd + skew * yd + cx) as f32, (fy * yd + cy) as f32));
            }
        }
        UndistortMap { width, height, coords }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn at(&self, x: u32, y: u32) -> (f32, f32) {
        self.coords[(y * self.width + x) as usize]
    }

    fn remap<P>(&self, src: &ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8>,
    {
        let mut out = ImageBuffer::new(self.width, self.height);
        for (x, y, px) in out.enumerate_pixels_mut() {
            let (sx, sy) = self.at(x, y);
            if let Some(sample) = bilinear(src, sx, sy) {
                *px = sample;
            }
        }
        out
    }

    /// Undistort one frame. Grayscale frames stay grayscale; anything else
    /// comes back as RGB.
    pub fn apply(&self, img: &DynamicImage) -> DynamicImage {
        match img {
            DynamicImage::ImageLuma8(gray) => DynamicImage::ImageLuma8(self.remap(gray)),
            other => DynamicImage::ImageRgb8(self.remap(&other.to_rgb8())),
        }
    }
}

/// Bilinear sample; pixels outside the source stay black.
fn bilinear<P>(src: &ImageBuffer<P, Vec<u8>>, sx: f32, sy: f32) -> Option<P>
where
    P: Pixel<Subpixel = u8>,
{
    // The right and bottom neighbours must exist too.
    let max_x = src.width().saturating_sub(1) as f32;
    let max_y = src.height().saturating_sub(1) as f32;
    if !(sx.is_finite() && sy.is_finite()) || sx < 0.0 || sy < 0.0 || sx >= max_x || sy >= max_y {
        return None;
    }
    let (x0, y0) = (sx.floor() as u32, sy.floor() as u32);
    let (fx, fy) = (sx - x0 as f32, sy - y0 as f32);
    let p00 = src.get_pixel(x0, y0).channels();
    let p10 = src.get_pixel(x0 + 1, y0).channels();
    let p01 = src.get_pixel(x0, y0 + 1).channels();
    let p11 = src.get_pixel(x0 + 1, y0 + 1).channels();

    let n = P::CHANNEL_COUNT as usize;
    let mut buf = [0u8; 4];
    for c in 0..n {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        buf[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(*P::from_slice(&buf[..n]))
}

/// Undistort every `ext` frame in `input_dir` into `output_dir`, keeping
/// filenames. Returns the number of frames written.
pub async fn undistort_dir(
    calibration: &Calibration,
    strategy: NewCameraMatrix,
    input_dir: &Path,
    output_dir: &Path,
    ext: &str,
) -> Result<usize> {
    tokio::fs::create_dir_all(output_dir).await?;
    let frames = list_files_with_ext(input_dir, ext)?;
    if frames.is_empty() {
        tracing::warn!("no frames found in {}", input_dir.display());
        return Ok(0);
    }

    let format = ImageFormat::from_path(&frames[0])?;
    let mut map: Option<UndistortMap> = None;
    let mut written = 0;
    for path in &frames {
        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable frame");
                continue;
            }
        };
        let size = (img.width(), img.height());
        if map.as_ref().map(|m| m.size()) != Some(size) {
            let new_k = calibration.new_camera_matrix(strategy, size.0, size.1);
            tracing::info!(width = size.0, height = size.1, ?strategy, camera_matrix = ?new_k, "building undistortion map");
            map = Some(UndistortMap::new(calibration, strategy, size.0, size.1));
        }
        let Some(m) = map.as_ref() else { continue };

        let undistorted = m.apply(&img);
        let mut encoded = Vec::new();
        undistorted.write_to(&mut Cursor::new(&mut encoded), format)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| PipelineError::InvalidRecord(format!("no file name in {}", path.display())))?;
        write_atomic(&output_dir.join(file_name), &encoded).await?;
        written += 1;
    }

    tracing::info!(frames = written, "undistorted {} -> {}", input_dir.display(), output_dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::DistortionModel;
    use image::{GrayImage, Luma};
    use tempfile::TempDir;

    fn pinhole(coeffs: Vec<f64>) -> Calibration {
        Calibration {
            distortion_model: DistortionModel::PlumbBob,
            camera_matrix: [50.0, 0.0, 16.0, 0.0, 50.0, 12.0, 0.0, 0.0, 1.0],
            distortion_coefficients: coeffs,
            reference_size: None,
        }
    }

    fn gradient(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([(x * 7 + y * 3) as u8]))
    }

    #[test]
    fn zero_distortion_is_identity_inside_border() {
        let map = UndistortMap::new(&pinhole(vec![0.0; 5]), NewCameraMatrix::Keep, 32, 24);
        let src = gradient(32, 24);
        let out = map.apply(&DynamicImage::ImageLuma8(src.clone())).to_luma8();
        for y in 1..23 {
            for x in 1..31 {
                assert_eq!(out.get_pixel(x, y), src.get_pixel(x, y), "pixel {},{}", x, y);
            }
        }
    }

    #[test]
    fn barrel_distortion_moves_samples_inward() {
        let map = UndistortMap::new(&pinhole(vec![-0.3, 0.0, 0.0, 0.0]), NewCameraMatrix::Keep, 32, 24);
        let (sx, _) = map.at(31, 12);
        assert!(sx < 31.0);
        let (cx, cy) = map.at(16, 12);
        assert!((cx - 16.0).abs() < 1e-4 && (cy - 12.0).abs() < 1e-4);
    }

    #[test]
    fn samples_far_outside_the_frame_are_black() {
        let src = gradient(8, 8);
        for (sx, sy) in [
            (f32::INFINITY, 1.0),
            (1.0, f32::NAN),
            (1e13, 2.0),
            (2.0, 4.3e9),
            (7.0, 3.0),
            (-0.5, 3.0),
        ] {
            assert!(bilinear(&src, sx, sy).is_none(), "({sx}, {sy}) sampled");
        }
        assert!(bilinear(&src, 6.5, 6.5).is_some());
    }

    #[test]
    fn extreme_distortion_does_not_panic() {
        let calib = Calibration {
            distortion_model: DistortionModel::PlumbBob,
            camera_matrix: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            distortion_coefficients: vec![1.0, 1.0, 0.0, 0.0, 1.0],
            reference_size: None,
        };
        let map = UndistortMap::new(&calib, NewCameraMatrix::Keep, 64, 64);
        let out = map.apply(&DynamicImage::ImageLuma8(gradient(64, 64))).to_luma8();
        assert_eq!(out.get_pixel(63, 63), &Luma([0]));
        assert_eq!(out.get_pixel(0, 0), &Luma([0]));
    }

    #[test]
    fn balanced_matrix_changes_the_remap() {
        let calib = Calibration {
            distortion_model: DistortionModel::Equidistant,
            camera_matrix: [20.0, 0.0, 16.0, 0.0, 20.0, 12.0, 0.0, 0.0, 1.0],
            distortion_coefficients: vec![0.0; 4],
            reference_size: None,
        };
        let keep = UndistortMap::new(&calib, NewCameraMatrix::Keep, 32, 24);
        let wide = UndistortMap::new(&calib, NewCameraMatrix::Balance(1.0), 32, 24);
        // The left edge of a wider view samples closer to the source border.
        let (kx, _) = keep.at(0, 12);
        let (wx, _) = wide.at(0, 12);
        assert!(wx < kx, "keep {kx}, balanced {wx}");
        assert!(wx > -0.5);
    }

    #[test]
    fn color_frames_stay_color() {
        let map = UndistortMap::new(&pinhole(vec![0.0; 4]), NewCameraMatrix::Keep, 8, 8);
        let rgb = image::RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]));
        let out = map.apply(&DynamicImage::ImageRgb8(rgb));
        assert_eq!(out.to_rgb8().get_pixel(3, 3), &image::Rgb([10, 20, 30]));
    }

    #[tokio::test]
    async fn undistorts_directory_keeping_names() -> anyhow::Result<()> {
        let tmpdir = TempDir::new()?;
        let input = tmpdir.path().join("in");
        std::fs::create_dir_all(&input)?;
        let name = "frame_000000_100_000000001.png";
        DynamicImage::ImageLuma8(gradient(16, 12)).save(input.join(name))?;
        std::fs::write(input.join("frame_000001_100_000000002.png"), b"garbage")?;

        let output = tmpdir.path().join("out");
        let n = undistort_dir(&pinhole(vec![0.01, 0.0, 0.0, 0.0]), NewCameraMatrix::Alpha(0.0), &input, &output, "png").await?;
        assert_eq!(n, 1);
        let out = image::open(output.join(name))?;
        assert_eq!((out.width(), out.height()), (16, 12));
        Ok(())
    }
}
