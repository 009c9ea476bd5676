//! Core data models for the subdirectory media scan

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::NodeError;

/// Media type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// Still or animated images (png, jpg, gif, webp, etc.)
    Image,
    /// Video containers (mp4, webm, mkv, etc.)
    Video,
    /// Unknown or unsupported media type
    Unknown,
}

impl MediaType {
    /// Infer media type from file extension
    pub fn from_extension(ext: &str) -> Self {
        let ext_lower = ext.to_lowercase();
        match ext_lower.as_str() {
            "png" | "jpg" | "jpeg" | "jfif" | "gif" | "webp" | "apng" | "mjpeg" | "bmp" => {
                MediaType::Image
            }
            "webm" | "mp4" | "mkv" | "ogg" | "ogv" | "mov" | "avi" | "m4v" => MediaType::Video,
            _ => MediaType::Unknown,
        }
    }

    /// Infer media type from a file name
    pub fn from_file_name(name: &str) -> Self {
        crate::config::extension_of(name)
            .map(|ext| Self::from_extension(&ext))
            .unwrap_or(MediaType::Unknown)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "image",
            MediaType::Video => "video",
            MediaType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One image or video found by a subdirectory scan
///
/// Field names are part of the front-end contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    /// File name without directory
    pub item: String,
    /// Creation time as seconds since the epoch
    pub file_age: f64,
    /// `image/<ext>` or `video/<ext>`
    pub format: String,
    /// File size in bytes
    pub file_size: u64,
    /// `[width, height]`, `[0, 0]` when unknown
    pub dimensions: [u32; 2],
    /// Whether the file is a video container
    pub is_video: bool,
    /// False when dimensions or frame data could not be read
    pub metadata_read: bool,
    /// Directory relative to the scan root, `/` separated
    pub subdirectory: String,
    /// Number of frames, -1 when unknown
    pub frame_count: i64,
    /// Frames per second, -1 when unknown
    pub fps: f64,
    /// Playback length, -1 when frame count or fps is unusable
    pub duration_in_seconds: f64,
    /// Generation metadata embedded in the container
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub metadata: Option<Map<String, Value>>,
}

impl MediaItem {
    /// Create a record with unknown media properties
    pub fn new(
        item: String,
        subdirectory: String,
        media_type: MediaType,
        extension: &str,
        file_size: u64,
        file_age: f64,
    ) -> Self {
        let is_video = media_type == MediaType::Video;
        Self {
            item,
            file_age,
            format: format!("{}/{}", if is_video { "video" } else { "image" }, extension),
            file_size,
            dimensions: [0, 0],
            is_video,
            metadata_read: true,
            subdirectory,
            frame_count: -1,
            fps: -1.0,
            duration_in_seconds: -1.0,
            metadata: None,
        }
    }

    /// Set frame count and fps, deriving the duration
    pub fn with_frames(mut self, frame_count: i64, fps: f64) -> Self {
        self.frame_count = frame_count;
        self.fps = fps;
        self.duration_in_seconds = if frame_count > 1 && fps > 1.0 {
            frame_count as f64 / fps
        } else {
            -1.0
        };
        self
    }

    /// Set the dimensions
    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = [width, height];
        self
    }

    /// Path relative to the scan root
    pub fn relative_path(&self) -> String {
        if self.subdirectory.is_empty() {
            self.item.clone()
        } else {
            format!("{}/{}", self.subdirectory, self.item)
        }
    }
}

/// Result of a subdirectory scan
#[derive(Debug, Default, Serialize)]
pub struct ScanResult {
    /// Every accepted item, ordered by subdirectory then name
    pub items: Vec<MediaItem>,
    /// Number of directories visited
    pub total_dirs: u64,
    /// Number of image items
    pub image_count: u64,
    /// Number of video items
    pub video_count: u64,
    /// Whether the scan stopped early on request
    pub cancelled: bool,
    /// Errors encountered while walking
    #[serde(skip)]
    pub errors: Vec<NodeError>,
    /// Total scan duration in milliseconds
    pub duration_ms: u64,
}

impl ScanResult {
    /// Create a new empty scan result
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of errors
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Check if the scan completed without errors
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_from_extension() {
        assert_eq!(MediaType::from_extension("png"), MediaType::Image);
        assert_eq!(MediaType::from_extension("JPEG"), MediaType::Image);
        assert_eq!(MediaType::from_extension("webp"), MediaType::Image);
        assert_eq!(MediaType::from_extension("mp4"), MediaType::Video);
        assert_eq!(MediaType::from_extension("WEBM"), MediaType::Video);
        assert_eq!(MediaType::from_extension("txt"), MediaType::Unknown);
        assert_eq!(MediaType::from_file_name("clip.ogg"), MediaType::Video);
        assert_eq!(MediaType::from_file_name("README"), MediaType::Unknown);
    }

    #[test]
    fn test_media_item_duration() {
        let item = MediaItem::new(
            "a.mp4".to_string(),
            String::new(),
            MediaType::Video,
            "mp4",
            10,
            0.0,
        )
        .with_frames(48, 24.0);
        assert_eq!(item.format, "video/mp4");
        assert!((item.duration_in_seconds - 2.0).abs() < f64::EPSILON);

        let still = MediaItem::new(
            "a.png".to_string(),
            "sub".to_string(),
            MediaType::Image,
            "png",
            10,
            0.0,
        )
        .with_frames(1, -1.0);
        assert_eq!(still.duration_in_seconds, -1.0);
        assert_eq!(still.relative_path(), "sub/a.png");
    }

    #[test]
    fn test_media_item_serializes_contract_fields() {
        let item = MediaItem::new(
            "a.png".to_string(),
            String::new(),
            MediaType::Image,
            "png",
            3,
            1.5,
        )
        .with_dimensions(64, 32);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["item"], "a.png");
        assert_eq!(value["dimensions"][0], 64);
        assert_eq!(value["is_video"], false);
        assert_eq!(value["frame_count"], -1);
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_scan_result_default() {
        let result = ScanResult::new();
        assert_eq!(result.items.len(), 0);
        assert_eq!(result.error_count(), 0);
        assert!(result.is_success());
    }
}
