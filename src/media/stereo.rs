//! Stereoscopic pairs from an image and its depth map

use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{NodeError, Result};

/// How the two views are arranged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StereoMode {
    /// Left view beside the right view
    #[default]
    SideBySide,
    /// Left view above the right view
    OverUnder,
}

impl FromStr for StereoMode {
    type Err = NodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sbs" | "side-by-side (sbs)" => Ok(StereoMode::SideBySide),
            "ou" | "over-under (ou)" => Ok(StereoMode::OverUnder),
            other => Err(NodeError::invalid_input(format!(
                "Mode should be SBS or OU, got {}",
                other
            ))),
        }
    }
}

/// Shift every channel sample by half its disparity to the left and right
///
/// The disparity of a sample is its depth value scaled from `0..=255` to
/// `0..=max_disparity`. Samples shifted out of the frame are dropped and
/// uncovered samples stay black.
pub fn create_stereoscopic_image(
    image: &RgbImage,
    depth: &RgbImage,
    max_disparity: f64,
    mode: StereoMode,
    swap: bool,
) -> Result<RgbImage> {
    if image.dimensions() != depth.dimensions() {
        return Err(NodeError::invalid_input(format!(
            "Depth map is {:?} but the image is {:?}",
            depth.dimensions(),
            image.dimensions()
        )));
    }
    let (width, height) = image.dimensions();
    let row_len = width as usize * 3;

    let mut left = vec![0u8; row_len * height as usize];
    let mut right = vec![0u8; row_len * height as usize];
    if row_len > 0 {
        let source = image.as_raw();
        let depth = depth.as_raw();
        left.par_chunks_mut(row_len)
            .zip(right.par_chunks_mut(row_len))
            .enumerate()
            .for_each(|(y, (left_row, right_row))| {
                let offset = y * row_len;
                for x in 0..width as usize {
                    for c in 0..3 {
                        let i = offset + x * 3 + c;
                        let disparity = depth[i] as f64 / 255.0 * max_disparity;
                        let left_x = (x as f64 - disparity / 2.0) as i64;
                        let right_x = (x as f64 + disparity / 2.0) as i64;
                        if (0..width as i64).contains(&left_x) {
                            left_row[left_x as usize * 3 + c] = source[i];
                        }
                        if (0..width as i64).contains(&right_x) {
                            right_row[right_x as usize * 3 + c] = source[i];
                        }
                    }
                }
            });
    }

    if swap {
        std::mem::swap(&mut left, &mut right);
    }

    let combined = match mode {
        StereoMode::SideBySide => {
            let mut out = Vec::with_capacity(left.len() * 2);
            if row_len > 0 {
                for (l, r) in left.chunks(row_len).zip(right.chunks(row_len)) {
                    out.extend_from_slice(l);
                    out.extend_from_slice(r);
                }
            }
            RgbImage::from_raw(width * 2, height, out)
        }
        StereoMode::OverUnder => {
            left.extend_from_slice(&right);
            RgbImage::from_raw(width, height * 2, left)
        }
    };
    combined.ok_or_else(|| NodeError::invalid_input("Stereo image size overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient() -> RgbImage {
        RgbImage::from_fn(4, 2, |x, y| Rgb([x as u8 * 10 + y as u8, 100, 200]))
    }

    #[test]
    fn test_zero_depth_copies_the_image() {
        let image = gradient();
        let depth = RgbImage::new(4, 2);
        let sbs = create_stereoscopic_image(&image, &depth, 1000.0, StereoMode::SideBySide, false)
            .unwrap();
        assert_eq!(sbs.dimensions(), (8, 2));
        for y in 0..2 {
            for x in 0..4 {
                assert_eq!(sbs.get_pixel(x, y), image.get_pixel(x, y));
                assert_eq!(sbs.get_pixel(x + 4, y), image.get_pixel(x, y));
            }
        }

        let ou = create_stereoscopic_image(&image, &depth, 1000.0, StereoMode::OverUnder, false)
            .unwrap();
        assert_eq!(ou.dimensions(), (4, 4));
        assert_eq!(ou.get_pixel(3, 3), image.get_pixel(3, 1));
    }

    #[test]
    fn test_disparity_shifts_views_apart() {
        let image = gradient();
        // disparity 2 everywhere: left view moves one pixel left, right view one right
        let depth = RgbImage::from_pixel(4, 2, Rgb([255, 255, 255]));
        let sbs = create_stereoscopic_image(&image, &depth, 2.0, StereoMode::SideBySide, false)
            .unwrap();
        assert_eq!(sbs.get_pixel(0, 0), image.get_pixel(1, 0));
        assert_eq!(sbs.get_pixel(3, 0), &Rgb([0, 0, 0]));
        assert_eq!(sbs.get_pixel(4, 0), &Rgb([0, 0, 0]));
        assert_eq!(sbs.get_pixel(5, 0), image.get_pixel(0, 0));

        let swapped = create_stereoscopic_image(&image, &depth, 2.0, StereoMode::SideBySide, true)
            .unwrap();
        assert_eq!(swapped.get_pixel(1, 0), image.get_pixel(0, 0));
    }

    #[test]
    fn test_mode_and_size_checks() {
        assert_eq!("Side-by-side (SBS)".parse::<StereoMode>().unwrap(), StereoMode::SideBySide);
        assert_eq!("ou".parse::<StereoMode>().unwrap(), StereoMode::OverUnder);
        assert!("anaglyph".parse::<StereoMode>().is_err());
        let err = create_stereoscopic_image(
            &gradient(),
            &RgbImage::new(2, 2),
            10.0,
            StereoMode::SideBySide,
            false,
        );
        assert!(err.is_err());
    }
}
