//! Per-container metadata extraction and injection
//!
//! Reading returns dimensions, frame data and the generation metadata a
//! file carries. Writing embeds a JSON object back into PNG text chunks,
//! an EXIF `UserComment` (JPEG, WebP) or a GIF comment extension.

pub mod exif;
pub mod gif;
pub mod png;
pub mod video;

use log::{debug, warn};
use serde_json::{Map, Value};
use std::path::Path;

use crate::config::{extension_of, ToolPaths};
use crate::error::{NodeError, NodeErrorKind, Result};
use crate::models::MediaType;

/// What could be learned about a media file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedMetadata {
    /// Width and height in pixels
    pub dimensions: Option<(u32, u32)>,
    /// Number of frames
    pub frame_count: Option<i64>,
    /// Frames per second
    pub fps: Option<f64>,
    /// Generation metadata embedded in the container
    pub embedded: Option<Map<String, Value>>,
    /// False when only part of the information could be read
    pub complete: bool,
}

/// Reads container metadata using the configured external tools
#[derive(Debug, Clone, Default)]
pub struct MetadataExtractor {
    tools: ToolPaths,
}

impl MetadataExtractor {
    /// Create an extractor
    pub fn new(tools: ToolPaths) -> Self {
        Self { tools }
    }

    /// Extract metadata from a file
    pub fn extract(&self, path: &Path) -> Result<ExtractedMetadata> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NodeError::invalid_path(path, "File name is not valid UTF-8"))?;
        extract(path, MediaType::from_file_name(name), &self.tools)
    }
}

/// Extract metadata from a file of a known media type
pub fn extract(path: &Path, media_type: MediaType, tools: &ToolPaths) -> Result<ExtractedMetadata> {
    let ext = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(extension_of)
        .unwrap_or_default();

    match (media_type, ext.as_str()) {
        (MediaType::Video, _) => extract_video(path, tools),
        (_, "png") | (_, "apng") => extract_png(path),
        (_, "gif") => extract_gif(path),
        (_, "jpg") | (_, "jpeg") | (_, "jfif") | (_, "webp") => extract_exif_image(path),
        (MediaType::Image, _) => {
            let (w, h) = image::image_dimensions(path)?;
            Ok(ExtractedMetadata {
                dimensions: Some((w, h)),
                frame_count: Some(1),
                complete: true,
                ..Default::default()
            })
        }
        (MediaType::Unknown, _) => Err(NodeError::invalid_input(format!(
            "Unsupported media file: {:?}",
            path
        ))),
    }
}

fn extract_png(path: &Path) -> Result<ExtractedMetadata> {
    let info = png::read_png_info(path)?;
    let embedded: Map<String, Value> = info
        .texts
        .into_iter()
        .map(|(key, text)| (key, parse_json_or_string(&text)))
        .collect();

    Ok(ExtractedMetadata {
        dimensions: Some((info.width, info.height)),
        frame_count: Some(info.frame_count as i64),
        fps: info.fps,
        embedded: non_empty(embedded),
        complete: true,
    })
}

fn extract_gif(path: &Path) -> Result<ExtractedMetadata> {
    let data = std::fs::read(path).map_err(|e| NodeError::from(e).with_path(path))?;
    let info = gif::read_gif_info(&data).map_err(|e| e.with_path(path))?;
    let fps = info.fps();

    let mut embedded = Map::new();
    for comment in &info.comments {
        merge_comment(&mut embedded, comment, "comment");
    }

    Ok(ExtractedMetadata {
        dimensions: Some((info.width, info.height)),
        frame_count: Some(info.frame_count as i64),
        fps,
        embedded: non_empty(embedded),
        complete: true,
    })
}

fn extract_exif_image(path: &Path) -> Result<ExtractedMetadata> {
    let (w, h) = image::image_dimensions(path).map_err(|e| NodeError::from(e).with_path(path))?;

    let embedded = match exif::read_user_comment(path) {
        Ok(Some(comment)) => {
            let mut map = Map::new();
            merge_comment(&mut map, &comment, "parameters");
            non_empty(map)
        }
        Ok(None) => None,
        Err(e) => {
            debug!("No EXIF metadata from {:?}: {}", path, e);
            None
        }
    };

    Ok(ExtractedMetadata {
        dimensions: Some((w, h)),
        frame_count: Some(1),
        fps: None,
        embedded,
        complete: true,
    })
}

fn extract_video(path: &Path, tools: &ToolPaths) -> Result<ExtractedMetadata> {
    match video::probe(path, &tools.ffprobe) {
        Ok(probe) => {
            let mut embedded = Map::new();
            if let Some(comment) = &probe.comment {
                merge_comment(&mut embedded, comment, "comment");
            }
            Ok(ExtractedMetadata {
                dimensions: Some((probe.width, probe.height)),
                frame_count: probe.frame_count,
                fps: probe.fps,
                embedded: non_empty(embedded),
                complete: probe.width > 0 && probe.height > 0,
            })
        }
        Err(probe_err) => {
            warn!("ffprobe unavailable for {:?}: {}", path, probe_err);
            let comment = video::scan_file_comment(path)?;
            let mut embedded = Map::new();
            if let Some(comment) = &comment {
                merge_comment(&mut embedded, comment, "comment");
            }
            Ok(ExtractedMetadata {
                embedded: non_empty(embedded),
                complete: false,
                ..Default::default()
            })
        }
    }
}

/// Parse text as JSON, keeping it as a string when it is not JSON
pub fn parse_json_or_string(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Merge a comment into a metadata object
///
/// A JSON object comment contributes its keys; anything else is stored
/// under `fallback_key`.
fn merge_comment(into: &mut Map<String, Value>, comment: &str, fallback_key: &str) {
    match parse_json_or_string(comment) {
        Value::Object(map) => into.extend(map),
        other => {
            into.insert(fallback_key.to_string(), other);
        }
    }
}

fn non_empty(map: Map<String, Value>) -> Option<Map<String, Value>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Render a metadata value the way it is stored in a text field
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Embed a metadata object into an encoded image
///
/// `ext` selects the container. PNG gets one text chunk per key, the other
/// formats get the whole object as JSON.
pub fn embed(data: &[u8], ext: &str, metadata: &Map<String, Value>) -> Result<Vec<u8>> {
    match ext.to_lowercase().as_str() {
        "png" | "apng" => {
            let entries: Vec<(String, String)> = metadata
                .iter()
                .map(|(k, v)| (k.clone(), value_to_text(v)))
                .collect();
            png::inject_text_chunks(data, &entries)
        }
        "gif" => gif::inject_comment(data, &sorted_json(metadata, true)?),
        "jpg" | "jpeg" | "jfif" => embed_jpeg(data, metadata),
        "webp" => exif::inject_into_webp(data, &sorted_json(metadata, false)?),
        other => Err(NodeError::invalid_input(format!(
            "Cannot embed metadata into .{} files",
            other
        ))),
    }
}

/// JPEG metadata has to fit one APP1 segment; when it does not, the prompt
/// and workflow are dropped and the rest is written
fn embed_jpeg(data: &[u8], metadata: &Map<String, Value>) -> Result<Vec<u8>> {
    let is_graph = |key: &str| matches!(key, "prompt" | "workflow");
    let has_graph = metadata.keys().any(|k| is_graph(k.as_str()));
    match exif::inject_into_jpeg(data, &sorted_json(metadata, false)?) {
        Err(e) if e.kind == NodeErrorKind::InvalidInput && has_graph => {
            warn!("{}, saving JPEG metadata without prompt and workflow", e);
            let reduced: Map<String, Value> = metadata
                .iter()
                .filter(|(key, _)| !is_graph(key.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            exif::inject_into_jpeg(data, &sorted_json(&reduced, false)?)
        }
        other => other,
    }
}

/// Embed a metadata object into a file in place
pub fn embed_in_file(path: &Path, metadata: &Map<String, Value>) -> Result<()> {
    let ext = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(extension_of)
        .unwrap_or_default();
    let data = std::fs::read(path).map_err(|e| NodeError::from(e).with_path(path))?;
    let updated = embed(&data, &ext, metadata).map_err(|e| e.with_path(path))?;
    std::fs::write(path, updated).map_err(|e| NodeError::from(e).with_path(path))?;
    Ok(())
}

/// JSON with keys in sorted order, optionally indented by two spaces
pub fn sorted_json(metadata: &Map<String, Value>, pretty: bool) -> Result<String> {
    let sorted: std::collections::BTreeMap<&String, &Value> = metadata.iter().collect();
    let text = if pretty {
        serde_json::to_string_pretty(&sorted)?
    } else {
        serde_json::to_string(&sorted)?
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(ext: &str) -> Vec<u8> {
        let frame = image::RgbImage::from_pixel(3, 2, image::Rgb([9, 9, 9]));
        let mut out = std::io::Cursor::new(Vec::new());
        let format = image::ImageFormat::from_extension(ext).unwrap();
        image::DynamicImage::ImageRgb8(frame)
            .write_to(&mut out, format)
            .unwrap();
        out.into_inner()
    }

    fn metadata() -> Map<String, Value> {
        json!({"prompt": {"3": {"class_type": "KSampler"}}, "workflow": "w"})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn test_embed_then_extract_each_container() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ToolPaths::default();
        for ext in ["png", "gif", "jpg", "webp"] {
            let path = dir.path().join(format!("a.{}", ext));
            std::fs::write(&path, sample(ext)).unwrap();
            embed_in_file(&path, &metadata()).unwrap();

            let extracted = extract(&path, MediaType::Image, &tools).unwrap();
            assert_eq!(extracted.dimensions, Some((3, 2)), "{}", ext);
            assert!(extracted.complete);
            let embedded = extracted.embedded.unwrap();
            assert_eq!(embedded["prompt"]["3"]["class_type"], "KSampler", "{}", ext);
            assert_eq!(embedded["workflow"], "w", "{}", ext);
        }
    }

    #[test]
    fn test_oversized_jpeg_metadata_drops_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.jpg");
        std::fs::write(&path, sample("jpg")).unwrap();
        let mut big = metadata();
        big.insert("workflow".to_string(), Value::String("n".repeat(70_000)));
        big.insert("seed".to_string(), json!(42));
        embed_in_file(&path, &big).unwrap();

        let extracted = extract(&path, MediaType::Image, &ToolPaths::default()).unwrap();
        let embedded = extracted.embedded.unwrap();
        assert_eq!(embedded["seed"], 42);
        assert!(embedded.get("workflow").is_none());
        assert!(embedded.get("prompt").is_none());

        let mut only_big = Map::new();
        only_big.insert("notes".to_string(), Value::String("n".repeat(70_000)));
        assert!(embed(&sample("jpg"), "jpg", &only_big).is_err());
    }

    #[test]
    fn test_plain_comment_goes_under_fallback_key() {
        let mut map = Map::new();
        merge_comment(&mut map, "Steps: 20, Seed: 1", "parameters");
        assert_eq!(map["parameters"], "Steps: 20, Seed: 1");

        merge_comment(&mut map, r#"{"seed": 5}"#, "parameters");
        assert_eq!(map["seed"], 5);
    }

    #[test]
    fn test_sorted_json_orders_keys() {
        let map = json!({"b": 1, "a": 2}).as_object().unwrap().clone();
        assert_eq!(sorted_json(&map, false).unwrap(), r#"{"a":2,"b":1}"#);
        assert!(sorted_json(&map, true).unwrap().contains("\n  \"a\": 2"));
    }

    #[test]
    fn test_video_without_ffprobe_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.webm");
        std::fs::write(&path, b"not really a video").unwrap();
        let tools = ToolPaths {
            ffprobe: dir.path().join("missing-ffprobe"),
            ..ToolPaths::default()
        };

        let extracted = extract(&path, MediaType::Video, &tools).unwrap();
        assert!(!extracted.complete);
        assert_eq!(extracted.dimensions, None);
    }

    #[test]
    fn test_extractor_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hi").unwrap();
        assert!(MetadataExtractor::default().extract(&path).is_err());
    }
}
