//! Media nodes: loading frames, frame sequence helpers and uploads

pub mod info;
pub mod loader;
pub mod stereo;

use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{extension_of, BackendConfig};
use crate::error::{NodeError, Result};
use crate::folders::{is_contained, to_slash, FolderPaths};
use crate::output::formats::VideoFormats;

pub use info::MediaInfo;
pub use loader::{
    load_visual_media, load_visual_media_batch, FrameSelection, FrameWindow, LoadedMedia, TimeUnit,
};
pub use stereo::{create_stereoscopic_image, StereoMode};

/// Subdirectory of `input` and `temp` that receives media uploads
pub const UPLOAD_SUBDIRECTORY: &str = "upload_media";

/// Directory types offered as upload targets
pub const UPLOAD_DIRECTORY_TYPES: &[&str] = &["input", "temp"];

/// Append the frames in reverse for a ping-pong loop
///
/// `remove_head` drops the first reversed frame (the last original frame)
/// and `remove_tail` the last one, so the seam frames are not doubled.
pub fn append_reversed_frames<T: Clone>(
    frames: &[T],
    remove_head: bool,
    remove_tail: bool,
) -> Vec<T> {
    let mut reversed: Vec<T> = frames.iter().rev().cloned().collect();
    if remove_head && !reversed.is_empty() {
        reversed.remove(0);
    }
    if remove_tail {
        reversed.pop();
    }

    let mut out = frames.to_vec();
    out.extend(reversed);
    out
}

/// Media that can be picked for upload nodes, as `<dir>/<file>` sorted
///
/// Looks in `input`, then in every directory below `input/upload_media`
/// and `temp/upload_media`.
pub fn list_uploadable_media(folders: &FolderPaths, formats: &VideoFormats) -> Vec<String> {
    let mut dirs = vec!["input".to_string()];
    for kind in UPLOAD_DIRECTORY_TYPES {
        let upload_root = format!("{}/{}", kind, UPLOAD_SUBDIRECTORY);
        dirs.push(upload_root.clone());

        let full = folders.resolve(&upload_root);
        for entry in WalkDir::new(&full)
            .min_depth(1)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            if let Ok(relative) = entry.path().strip_prefix(&full) {
                dirs.push(format!("{}/{}", upload_root, to_slash(relative)));
            }
        }
    }

    let mut files = Vec::new();
    for dir in &dirs {
        let entries = match fs::read_dir(folders.resolve(dir)) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping upload directory {}: {}", dir, e);
                continue;
            }
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_file() && BackendConfig::is_acceptable_for_upload(&name, formats) {
                files.push(format!("{}/{}", dir, name));
            }
        }
    }

    files.sort();
    files
}

/// Full path of a media entry picked from [`list_uploadable_media`]
pub fn resolve_uploaded_media(folders: &FolderPaths, media: &str) -> Result<PathBuf> {
    if !is_contained(Path::new(media)) {
        return Err(NodeError::invalid_path(media, "Media path escapes the host root"));
    }
    let full = folders.resolve(media);
    if !full.is_file() {
        return Err(NodeError::not_found(full));
    }
    Ok(full)
}

/// Lowercase extension of a path, empty when it has none
pub(crate) fn path_extension(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(extension_of)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_reversed_frames() {
        let frames = [1, 2, 3];
        assert_eq!(append_reversed_frames(&frames, false, false), vec![1, 2, 3, 3, 2, 1]);
        assert_eq!(append_reversed_frames(&frames, true, false), vec![1, 2, 3, 2, 1]);
        assert_eq!(append_reversed_frames(&frames, true, true), vec![1, 2, 3, 2]);
        assert!(append_reversed_frames::<u8>(&[], true, true).is_empty());
    }

    #[test]
    fn test_list_uploadable_media() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("input/upload_media/clips")).unwrap();
        fs::create_dir_all(root.join("temp/upload_media")).unwrap();
        fs::write(root.join("input/a.png"), b"").unwrap();
        fs::write(root.join("input/readme.txt"), b"").unwrap();
        fs::write(root.join("input/upload_media/b.mkv"), b"").unwrap();
        fs::write(root.join("input/upload_media/clips/c.webm"), b"").unwrap();
        fs::write(root.join("temp/upload_media/d.gif"), b"").unwrap();
        fs::write(root.join("temp/upload_media/e.mov"), b"").unwrap();
        fs::write(root.join("temp/upload_media/f.avi"), b"").unwrap();

        let config = BackendConfig::new(root.to_path_buf());
        let folders = FolderPaths::new(&config);
        assert_eq!(
            list_uploadable_media(&folders, &VideoFormats::builtin()),
            vec![
                "input/a.png",
                "input/upload_media/b.mkv",
                "input/upload_media/clips/c.webm",
                "temp/upload_media/d.gif",
                "temp/upload_media/e.mov",
            ]
        );

        assert_eq!(
            resolve_uploaded_media(&folders, "input/a.png").unwrap(),
            root.join("input/a.png")
        );
        assert!(resolve_uploaded_media(&folders, "input/missing.png").is_err());
        assert!(resolve_uploaded_media(&folders, "../escape.png").is_err());
    }
}
