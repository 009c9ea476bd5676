//! Configuration for the backend, the scanner and the media nodes

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{NodeError, Result};
use crate::output::formats::VideoFormats;

/// Default address the backend listens on
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8189";

/// Default width of the small scan pool
pub const DEFAULT_SMALL_POOL_THREADS: usize = 3;

/// Videos per directory level above which the wide pool is used
pub const DEFAULT_VIDEO_WIDE_THRESHOLD: usize = 60;

/// Same as above for recursive scans
pub const DEFAULT_VIDEO_WIDE_THRESHOLD_RECURSIVE: usize = 200;

/// Images per directory level above which the wide pool is used
pub const DEFAULT_IMAGE_WIDE_THRESHOLD: usize = 5000;

/// Same as above for recursive scans
pub const DEFAULT_IMAGE_WIDE_THRESHOLD_RECURSIVE: usize = 10000;

/// Video extensions that play in most browsers
pub const BROWSER_VIDEO_EXTENSIONS: &[&str] = &["webm", "mp4", "ogg"];

/// Video extensions accepted for upload, before the video format presets
pub const UPLOAD_VIDEO_EXTENSIONS: &[&str] = &["webm", "mp4", "mkv", "ogg"];

/// Image extensions that may carry more than one frame
pub const ANIMATED_IMAGE_EXTENSIONS: &[&str] = &["gif", "webp", "apng", "mjpeg"];

/// Single-frame image extensions
pub const STILL_IMAGE_EXTENSIONS: &[&str] = &["gif", "webp", "png", "jpg", "jpeg", "jfif"];

/// Thresholds that drive the scan concurrency strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanThresholds {
    /// Worker count of the small pool
    pub small_pool_threads: usize,
    /// Worker count of the wide pool, 0 = auto (cores, halved when recursive)
    pub wide_pool_threads: usize,
    /// Video count above which a flat scan uses the wide pool
    pub video_wide: usize,
    /// Video count above which a recursive scan uses the wide pool
    pub video_wide_recursive: usize,
    /// Image count above which a flat scan uses the wide pool
    pub image_wide: usize,
    /// Image count above which a recursive scan uses the wide pool
    pub image_wide_recursive: usize,
}

impl Default for ScanThresholds {
    fn default() -> Self {
        Self {
            small_pool_threads: DEFAULT_SMALL_POOL_THREADS,
            wide_pool_threads: 0,
            video_wide: DEFAULT_VIDEO_WIDE_THRESHOLD,
            video_wide_recursive: DEFAULT_VIDEO_WIDE_THRESHOLD_RECURSIVE,
            image_wide: DEFAULT_IMAGE_WIDE_THRESHOLD,
            image_wide_recursive: DEFAULT_IMAGE_WIDE_THRESHOLD_RECURSIVE,
        }
    }
}

impl ScanThresholds {
    /// Video threshold for the given walk mode
    pub fn video_threshold(&self, recursive: bool) -> usize {
        if recursive {
            self.video_wide_recursive
        } else {
            self.video_wide
        }
    }

    /// Image threshold for the given walk mode
    pub fn image_threshold(&self, recursive: bool) -> usize {
        if recursive {
            self.image_wide_recursive
        } else {
            self.image_wide
        }
    }

    /// Effective width of the wide pool
    ///
    /// Recursive scans spawn one pool per level, so they get half the cores.
    pub fn effective_wide_threads(&self, recursive: bool) -> usize {
        if self.wide_pool_threads > 0 {
            return self.wide_pool_threads;
        }
        let cores = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        if recursive {
            (cores / 2).max(1)
        } else {
            cores
        }
    }
}

/// External executables used by the media nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    /// ffmpeg executable
    pub ffmpeg: PathBuf,
    /// ffprobe executable
    pub ffprobe: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// Configuration for the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Root of the host application; relative paths resolve against it
    pub comfy_root: PathBuf,

    /// Address the HTTP backend binds to
    pub bind_address: String,

    /// SQLite file holding front-end settings
    /// Relative paths resolve against `comfy_root`
    pub settings_db: PathBuf,

    /// Model type -> directories holding models of that type
    pub model_folders: BTreeMap<String, Vec<PathBuf>>,

    /// Directory of wildcard `.txt` files
    pub wildcards_dir: Option<PathBuf>,

    /// Directory of extra video format presets (`*.json`)
    pub video_formats_dir: Option<PathBuf>,

    /// External executables
    pub tools: ToolPaths,

    /// Scanner concurrency thresholds
    pub scan: ScanThresholds,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            comfy_root: PathBuf::from("."),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            settings_db: PathBuf::from("jnodes_settings.db"),
            model_folders: Self::default_model_folders(),
            wildcards_dir: None,
            video_formats_dir: None,
            tools: ToolPaths::default(),
            scan: ScanThresholds::default(),
        }
    }
}

impl BackendConfig {
    /// Create a new config rooted at the given directory
    pub fn new(comfy_root: PathBuf) -> Self {
        Self {
            comfy_root,
            ..Default::default()
        }
    }

    /// Create a config builder
    pub fn builder() -> BackendConfigBuilder {
        BackendConfigBuilder::new()
    }

    /// Load a config from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| NodeError::from(e).with_path(path))?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Default model folders, relative to the host root
    pub fn default_model_folders() -> BTreeMap<String, Vec<PathBuf>> {
        [
            "checkpoints",
            "loras",
            "vae",
            "embeddings",
            "controlnet",
            "upscale_models",
        ]
        .iter()
        .map(|name| (name.to_string(), vec![PathBuf::from("models").join(name)]))
        .collect()
    }

    /// Settings database path, resolved against the host root
    pub fn settings_db_path(&self) -> PathBuf {
        if self.settings_db.is_absolute() {
            self.settings_db.clone()
        } else {
            self.comfy_root.join(&self.settings_db)
        }
    }

    /// Get the video extensions that play in browsers
    pub fn browser_video_extensions() -> HashSet<String> {
        to_set(BROWSER_VIDEO_EXTENSIONS)
    }

    /// Get every image extension the drawer can show
    pub fn image_extensions() -> HashSet<String> {
        let mut extensions = to_set(STILL_IMAGE_EXTENSIONS);
        extensions.extend(to_set(ANIMATED_IMAGE_EXTENSIONS));
        extensions
    }

    /// Extensions the front end can display
    pub fn browser_display_extensions() -> HashSet<String> {
        let mut extensions = Self::browser_video_extensions();
        extensions.extend(Self::image_extensions());
        extensions
    }

    /// Extensions accepted for upload, including every video format output
    pub fn upload_extensions(formats: &VideoFormats) -> HashSet<String> {
        let mut extensions = to_set(UPLOAD_VIDEO_EXTENSIONS);
        extensions.extend(formats.extensions().into_iter().map(|e| e.to_lowercase()));
        extensions.extend(Self::image_extensions());
        extensions
    }

    /// Check if a file name can be displayed by the front end
    pub fn is_acceptable_for_browser_display(name: &str) -> bool {
        extension_of(name)
            .map(|ext| Self::browser_display_extensions().contains(&ext))
            .unwrap_or(false)
    }

    /// Check if a file name is accepted for upload
    pub fn is_acceptable_for_upload(name: &str, formats: &VideoFormats) -> bool {
        extension_of(name)
            .map(|ext| Self::upload_extensions(formats).contains(&ext))
            .unwrap_or(false)
    }

    /// Video format presets, overlaid with the JSON files in `video_formats_dir`
    ///
    /// A relative directory is taken from the host root.
    pub fn video_formats(&self) -> Result<VideoFormats> {
        let dir = self.video_formats_dir.as_ref().map(|d| self.comfy_root.join(d));
        VideoFormats::load(dir.as_deref())
    }
}

/// Lowercase extension of a file name, without the dot
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

fn to_set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Builder for BackendConfig
#[derive(Debug, Default)]
pub struct BackendConfigBuilder {
    config: BackendConfig,
}

impl BackendConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config
    pub fn from_config(config: BackendConfig) -> Self {
        Self { config }
    }

    /// Set the host root
    pub fn comfy_root(mut self, root: PathBuf) -> Self {
        self.config.comfy_root = root;
        self
    }

    /// Set the bind address
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.bind_address = address.into();
        self
    }

    /// Set the settings database path
    pub fn settings_db(mut self, path: PathBuf) -> Self {
        self.config.settings_db = path;
        self
    }

    /// Register a directory for a model type
    pub fn add_model_folder(mut self, model_type: impl Into<String>, dir: PathBuf) -> Self {
        self.config
            .model_folders
            .entry(model_type.into())
            .or_default()
            .push(dir);
        self
    }

    /// Set the wildcard directory
    pub fn wildcards_dir(mut self, dir: PathBuf) -> Self {
        self.config.wildcards_dir = Some(dir);
        self
    }

    /// Set the directory of extra video format presets
    pub fn video_formats_dir(mut self, dir: PathBuf) -> Self {
        self.config.video_formats_dir = Some(dir);
        self
    }

    /// Set the ffmpeg executable
    pub fn ffmpeg(mut self, path: PathBuf) -> Self {
        self.config.tools.ffmpeg = path;
        self
    }

    /// Set the ffprobe executable
    pub fn ffprobe(mut self, path: PathBuf) -> Self {
        self.config.tools.ffprobe = path;
        self
    }

    /// Set the scan thresholds
    pub fn scan_thresholds(mut self, thresholds: ScanThresholds) -> Self {
        self.config.scan = thresholds;
        self
    }

    /// Build the config
    pub fn build(self) -> BackendConfig {
        self.config
    }
}
