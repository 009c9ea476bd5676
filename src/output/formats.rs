//! ffmpeg encoder presets for video outputs

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{NodeError, Result};

/// Arguments and container of one ffmpeg encoder preset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    /// Container extension of the encoded file, without the dot
    pub extension: String,
    /// Encoder arguments placed after the raw input
    pub main_pass: Vec<String>,
    /// Extra environment for the ffmpeg process
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl VideoFormat {
    fn new(extension: &str, main_pass: &[&str]) -> Self {
        Self {
            extension: extension.to_string(),
            main_pass: main_pass.iter().map(|s| s.to_string()).collect(),
            environment: BTreeMap::new(),
        }
    }
}

/// Presets by name, as offered in `video/<name>` formats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormats {
    formats: BTreeMap<String, VideoFormat>,
}

impl Default for VideoFormats {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VideoFormats {
    pub fn builtin() -> Self {
        let mut formats = BTreeMap::new();
        formats.insert(
            "h264-mp4".to_string(),
            VideoFormat::new("mp4", &["-n", "-c:v", "libx264", "-pix_fmt", "yuv420p"]),
        );
        formats.insert(
            "h265-mp4".to_string(),
            VideoFormat::new(
                "mp4",
                &["-n", "-c:v", "libx265", "-vtag", "hvc1", "-pix_fmt", "yuv420p10le"],
            ),
        );
        formats.insert(
            "webm".to_string(),
            VideoFormat::new(
                "webm",
                &["-n", "-c:v", "libvpx-vp9", "-b:v", "0", "-pix_fmt", "yuv420p"],
            ),
        );
        formats.insert(
            "av1-webm".to_string(),
            VideoFormat::new("webm", &["-n", "-c:v", "libsvtav1", "-pix_fmt", "yuv420p10le"]),
        );
        formats.insert(
            "ProRes".to_string(),
            VideoFormat::new(
                "mov",
                &["-n", "-c:v", "prores_ks", "-profile:v", "3", "-pix_fmt", "yuv422p10"],
            ),
        );
        Self { formats }
    }

    /// Built-in presets overlaid with every `<name>.json` in `dir`
    ///
    /// Files that fail to parse are skipped with a warning. A missing
    /// directory leaves the built-in set.
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut presets = Self::builtin();
        let dir = match dir {
            Some(dir) if dir.is_dir() => dir,
            Some(dir) => {
                debug!("Video format directory {:?} does not exist", dir);
                return Ok(presets);
            }
            None => return Ok(presets),
        };

        let entries = fs::read_dir(dir).map_err(|e| NodeError::from(e).with_path(dir))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let parsed = fs::read_to_string(&path)
                .map_err(NodeError::from)
                .and_then(|text| serde_json::from_str::<VideoFormat>(&text).map_err(NodeError::from));
            match parsed {
                Ok(format) => {
                    presets.formats.insert(name, format);
                }
                Err(e) => warn!("Skipping video format {:?}: {}", path, e),
            }
        }
        Ok(presets)
    }

    pub fn get(&self, name: &str) -> Option<&VideoFormat> {
        self.formats.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formats.keys().map(String::as_str)
    }

    /// Container extensions of every preset, in name order
    pub fn extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = Vec::new();
        for format in self.formats.values() {
            if !extensions.contains(&format.extension) {
                extensions.push(format.extension.clone());
            }
        }
        extensions
    }

    /// Every output format, image formats first
    pub fn format_types(&self) -> Vec<String> {
        super::IMAGE_OUTPUT_FORMATS
            .iter()
            .map(|f| format!("image/{}", f))
            .chain(self.names().map(|name| format!("video/{}", name)))
            .collect()
    }
}
