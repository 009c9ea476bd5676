//! Selector nodes: booleans, image sizes, list entries and random files

use log::debug;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{NodeError, Result};
use crate::folders::FolderPaths;
use crate::prompts::SelectionMode;

/// Built-in image sizes, `WIDTHxHEIGHT`
pub const IMAGE_SIZES: &[&str] = &[
    "128x128", "256x256", "480x480", "512x512", "768x768", "1024x1024", "2048x2048", "4096x4096",
    "512x400", "720x480", "768x512", "854x480", "960x540", "1280x720", "1600x900", "1920x1080",
    "2560x1440", "3840x2160", "7680x4320", "1152x896",
];

/// Image formats offered before the video presets
pub const IMAGE_FORMATS: &[&str] = &["jpg", "jpeg", "jfif", "png", "gif", "webp", "apng", "mjpeg"];

/// Entry put in front of the VAE list for the checkpoint's own VAE
pub const BAKED_VAE: &str = "Baked VAE";

/// Smallest accepted side of a selected size
const MIN_SIDE: i64 = 2;

/// The value and its text, booleans rendered as `True` / `False`
pub fn boolean_selector(value: bool) -> (bool, String) {
    let text = if value { "True" } else { "False" };
    (value, text.to_string())
}

/// Inputs of the image size selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSizeRequest {
    /// One of [`IMAGE_SIZES`] or any `WIDTHxHEIGHT`
    pub size: String,
    pub use_custom_size: bool,
    pub custom_width: i64,
    pub custom_height: i64,
    pub flip: bool,
}

impl Default for ImageSizeRequest {
    fn default() -> Self {
        Self {
            size: "512x512".to_string(),
            use_custom_size: false,
            custom_width: 512,
            custom_height: 512,
            flip: false,
        }
    }
}

/// Width and height for a size request
///
/// Custom sizes are made positive and an invalid axis copies the other one;
/// when both are invalid the built-in size is used. Fails when the result
/// has a side below 2.
pub fn image_size_selector(request: &ImageSizeRequest) -> Result<(u32, u32)> {
    if request.use_custom_size {
        let mut x = request.custom_width.abs();
        let mut y = request.custom_height.abs();
        if x < MIN_SIDE && y >= MIN_SIDE {
            x = y;
        } else if y < MIN_SIDE && x >= MIN_SIDE {
            y = x;
        }
        if x >= MIN_SIDE && y >= MIN_SIDE {
            let (x, y) = (to_side(x)?, to_side(y)?);
            return Ok(if request.flip { (y, x) } else { (x, y) });
        }
        debug!("Custom size {}x{} is invalid, using {}", x, y, request.size);
    }

    let (x, y) = parse_size(&request.size)?;
    let (x, y) = if request.flip { (y, x) } else { (x, y) };
    if x < MIN_SIDE as u32 || y < MIN_SIDE as u32 {
        return Err(NodeError::invalid_input(format!(
            "Image size {}x{} must be at least {} on each side",
            x, y, MIN_SIDE
        )));
    }
    Ok((x, y))
}

fn parse_size(size: &str) -> Result<(u32, u32)> {
    let invalid = || NodeError::invalid_input(format!("Invalid image size: {}", size));
    let (x, y) = size.split_once('x').ok_or_else(invalid)?;
    let x = x.trim().parse().map_err(|_| invalid())?;
    let y = y.trim().parse().map_err(|_| invalid())?;
    Ok((x, y))
}

fn to_side(value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| NodeError::invalid_input(format!("Image side {} is too large", value)))
}

/// Pick an entry by seed or index, returning it with its text
pub fn select_from_list<T: Clone + Display>(
    mode: SelectionMode,
    index_or_seed: u64,
    list: &[T],
) -> Result<(T, String)> {
    let index = mode
        .pick(index_or_seed, list.len())
        .ok_or_else(|| NodeError::invalid_input("Cannot select from an empty list"))?;
    let value = list[index].clone();
    let text = value.to_string();
    Ok((value, text))
}

/// Built-in image formats followed by the video preset extensions
pub fn image_format_types<I, S>(video_extensions: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut formats: Vec<String> = IMAGE_FORMATS.iter().map(|s| s.to_string()).collect();
    for ext in video_extensions {
        let ext = ext.into();
        if !formats.contains(&ext) {
            formats.push(ext);
        }
    }
    formats
}

/// [`BAKED_VAE`] followed by every VAE model
pub fn vae_choices(folders: &FolderPaths) -> Vec<String> {
    std::iter::once(BAKED_VAE.to_string())
        .chain(folders.filename_list("vae").unwrap_or_default())
        .collect()
}

/// Pick a model of a type by seed or index
pub fn select_model(
    folders: &FolderPaths,
    model_type: &str,
    mode: SelectionMode,
    index_or_seed: u64,
) -> Result<(String, String)> {
    let names = folders.filename_list(model_type)?;
    select_from_list(mode, index_or_seed, &names)
}

/// Pick a file below `dir` with a generator seeded by `seed`
///
/// `file_type` filters by a case-insensitive name suffix. Candidates are
/// sorted first so a seed always picks the same file. `None` when nothing
/// matches.
pub fn select_random_file(
    dir: &Path,
    include_subdirectories: bool,
    file_type: Option<&str>,
    seed: u64,
) -> Option<PathBuf> {
    let suffix = file_type
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty());

    let mut walker = WalkDir::new(dir).min_depth(1).follow_links(true);
    if !include_subdirectories {
        walker = walker.max_depth(1);
    }

    let mut candidates: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| match &suffix {
            Some(suffix) => e
                .file_name()
                .to_string_lossy()
                .to_lowercase()
                .ends_with(suffix.as_str()),
            None => true,
        })
        .map(|e| e.into_path())
        .collect();
    candidates.sort();

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    candidates.choose(&mut rng).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn custom(x: i64, y: i64, flip: bool) -> ImageSizeRequest {
        ImageSizeRequest {
            size: "1280x720".to_string(),
            use_custom_size: true,
            custom_width: x,
            custom_height: y,
            flip,
        }
    }

    #[test]
    fn test_boolean_selector() {
        assert_eq!(boolean_selector(true), (true, "True".to_string()));
        assert_eq!(boolean_selector(false).1, "False");
    }

    #[test]
    fn test_builtin_sizes() {
        let mut request = ImageSizeRequest {
            size: "1280x720".to_string(),
            ..Default::default()
        };
        assert_eq!(image_size_selector(&request).unwrap(), (1280, 720));
        request.flip = true;
        assert_eq!(image_size_selector(&request).unwrap(), (720, 1280));
        request.size = "1x720".to_string();
        assert!(image_size_selector(&request).is_err());
        request.size = "wide".to_string();
        assert!(image_size_selector(&request).is_err());
    }

    #[test]
    fn test_custom_sizes() {
        assert_eq!(image_size_selector(&custom(-300, 200, false)).unwrap(), (300, 200));
        assert_eq!(image_size_selector(&custom(0, 200, false)).unwrap(), (200, 200));
        assert_eq!(image_size_selector(&custom(300, 1, false)).unwrap(), (300, 300));
        assert_eq!(image_size_selector(&custom(300, 200, true)).unwrap(), (200, 300));
        // both invalid: the built-in size
        assert_eq!(image_size_selector(&custom(1, 0, false)).unwrap(), (1280, 720));
    }

    #[test]
    fn test_select_from_list() {
        let list = ["a", "b", "c"];
        assert_eq!(select_from_list(SelectionMode::Seed, 4, &list).unwrap().0, "b");
        assert_eq!(select_from_list(SelectionMode::Index, 2, &list).unwrap().0, "c");
        assert_eq!(select_from_list(SelectionMode::Index, 5, &list).unwrap().1, "c");
        assert!(select_from_list::<&str>(SelectionMode::Seed, 0, &[]).is_err());
    }

    #[test]
    fn test_image_format_types() {
        let formats = image_format_types(["mp4", "webm", "mp4", "png"]);
        assert_eq!(formats.len(), IMAGE_FORMATS.len() + 2);
        assert_eq!(formats.last().map(String::as_str), Some("webm"));
    }

    #[test]
    fn test_select_random_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.png"), b"").unwrap();
        fs::write(dir.path().join("b.TXT"), b"").unwrap();
        fs::write(dir.path().join("sub/c.png"), b"").unwrap();

        for seed in 0..20 {
            let flat = select_random_file(dir.path(), false, Some(".png"), seed).unwrap();
            assert_eq!(flat, dir.path().join("a.png"));
            let txt = select_random_file(dir.path(), true, Some("txt"), seed).unwrap();
            assert_eq!(txt, dir.path().join("b.TXT"));
            assert_eq!(
                select_random_file(dir.path(), true, None, seed),
                select_random_file(dir.path(), true, None, seed)
            );
        }
        assert_eq!(select_random_file(dir.path(), true, Some(".gif"), 0), None);
        assert_eq!(select_random_file(&dir.path().join("missing"), true, None, 0), None);
    }
}
