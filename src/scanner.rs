//! Scanner module - walks a directory tree level by level and builds media records
//!
//! Symlinks are followed, both to files and to directories. Directories
//! already visited through another link are skipped.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::config::{extension_of, BackendConfig, ScanThresholds, ToolPaths};
use crate::error::{NodeError, Result};
use crate::metadata::MetadataExtractor;
use crate::models::{MediaItem, MediaType, ScanResult};
use crate::strategy::ConcurrencyStrategy;

/// Progress callback type
pub type ProgressCallback = Box<dyn Fn(&ScanProgress) + Send + Sync>;

/// Scan progress information, reported once per directory level
#[derive(Debug, Clone, Default)]
pub struct ScanProgress {
    /// Items accepted so far
    pub scanned_files: u64,
    /// Directories visited so far
    pub scanned_dirs: u64,
    /// Video items so far
    pub video_count: u64,
    /// Image items so far
    pub image_count: u64,
    /// Directory just processed, relative to the scan root
    pub current_dir: String,
    /// Elapsed time in milliseconds
    pub elapsed_ms: u64,
}

/// A displayable file found while listing a directory level
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    name: String,
    subdirectory: String,
    media_type: MediaType,
}

/// Lists displayable media under a root, optionally descending into subdirectories
pub struct SubdirectoryScanner {
    root: PathBuf,
    recursive: bool,
    thresholds: ScanThresholds,
    cancel: Arc<AtomicBool>,
    extractor: MetadataExtractor,
    progress: Option<ProgressCallback>,
}

impl SubdirectoryScanner {
    /// Create a scanner for `root`
    pub fn new(
        root: PathBuf,
        recursive: bool,
        thresholds: ScanThresholds,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            root,
            recursive,
            thresholds,
            cancel,
            extractor: MetadataExtractor::default(),
            progress: None,
        }
    }

    /// Use these external tools for video probing
    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.extractor = MetadataExtractor::new(tools);
        self
    }

    /// Call `callback` after every directory level
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run the scan
    ///
    /// A missing root yields an empty result. A cancelled scan returns what
    /// was gathered so far with `cancelled` set.
    pub fn scan(&self) -> ScanResult {
        let start = Instant::now();
        let mut result = ScanResult::new();

        if !self.root.is_dir() {
            debug!("Scan root {:?} is not a directory", self.root);
            result.duration_ms = start.elapsed().as_millis() as u64;
            return result;
        }

        let mut visited = HashSet::new();
        let mut pending = vec![String::new()];
        while let Some(subdirectory) = pending.pop() {
            if self.is_cancelled() {
                info!("Scan of {:?} cancelled", self.root);
                result.cancelled = true;
                break;
            }

            let directory = if subdirectory.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&subdirectory)
            };
            if let Ok(canonical) = fs::canonicalize(&directory) {
                if !visited.insert(canonical) {
                    debug!("Skipping {:?}, already scanned through another link", directory);
                    continue;
                }
            }

            let (candidates, children) = match self.list_level(&directory, &subdirectory) {
                Ok(level) => level,
                Err(e) => {
                    warn!("Unable to list {:?}: {}", directory, e);
                    result.errors.push(e);
                    continue;
                }
            };
            result.total_dirs += 1;

            let (videos, others): (Vec<Candidate>, Vec<Candidate>) = candidates
                .into_iter()
                .partition(|c| c.media_type == MediaType::Video);

            for (kind, group) in [(MediaType::Video, videos), (MediaType::Image, others)] {
                if group.is_empty() {
                    continue;
                }
                let strategy =
                    ConcurrencyStrategy::select(kind, group.len(), self.recursive, &self.thresholds);
                debug!(
                    "{} {} item(s) in {:?} with {:?}",
                    group.len(),
                    kind,
                    directory,
                    strategy
                );
                let items = strategy.run(&group, &self.thresholds, |c| self.process_item(c));
                for item in items.into_iter().flatten() {
                    if item.is_video {
                        result.video_count += 1;
                    } else {
                        result.image_count += 1;
                    }
                    result.items.push(item);
                }
            }

            if self.recursive {
                // Reverse so the stack pops children in name order
                pending.extend(children.into_iter().rev());
            }

            if let Some(callback) = &self.progress {
                callback(&ScanProgress {
                    scanned_files: result.items.len() as u64,
                    scanned_dirs: result.total_dirs,
                    video_count: result.video_count,
                    image_count: result.image_count,
                    current_dir: subdirectory.clone(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }
        }

        result.items.sort_by(|a, b| {
            a.subdirectory
                .cmp(&b.subdirectory)
                .then_with(|| a.item.cmp(&b.item))
        });
        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Scanned {:?}: {} item(s) in {} dir(s) in {}ms",
            self.root,
            result.items.len(),
            result.total_dirs,
            result.duration_ms
        );
        result
    }

    /// List one directory: displayable files and child subdirectory paths
    fn list_level(
        &self,
        directory: &Path,
        subdirectory: &str,
    ) -> Result<(Vec<Candidate>, Vec<String>)> {
        let entries = fs::read_dir(directory).map_err(|e| NodeError::from(e).with_path(directory))?;

        let mut candidates = Vec::new();
        let mut children = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry in {:?}: {}", directory, e);
                    continue;
                }
            };
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!("Skipping non UTF-8 name {:?}", raw);
                    continue;
                }
            };
            let path = entry.path();

            if path.is_file() {
                if BackendConfig::is_acceptable_for_browser_display(&name) {
                    candidates.push(Candidate {
                        media_type: MediaType::from_file_name(&name),
                        path,
                        name,
                        subdirectory: subdirectory.to_string(),
                    });
                }
            } else if self.recursive && path.is_dir() {
                children.push(join_relative(subdirectory, &name));
            }
        }

        candidates.sort_by(|a, b| a.name.cmp(&b.name));
        children.sort();
        Ok((candidates, children))
    }

    /// Build the record for one file; `None` when cancelled or the file vanished
    fn process_item(&self, candidate: &Candidate) -> Option<MediaItem> {
        if self.is_cancelled() {
            return None;
        }

        let metadata = match fs::metadata(&candidate.path) {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping {:?}: {}", candidate.path, e);
                return None;
            }
        };

        let extension = extension_of(&candidate.name).unwrap_or_default();
        let mut item = MediaItem::new(
            candidate.name.clone(),
            candidate.subdirectory.clone(),
            candidate.media_type,
            &extension,
            metadata.len(),
            file_age(&metadata),
        );

        match self.extractor.extract(&candidate.path) {
            Ok(extracted) => {
                if let Some((w, h)) = extracted.dimensions {
                    item = item.with_dimensions(w, h);
                }
                item = item.with_frames(
                    extracted.frame_count.unwrap_or(-1),
                    extracted.fps.unwrap_or(-1.0),
                );
                item.metadata = extracted.embedded;
                item.metadata_read = extracted.complete;
            }
            Err(e) => {
                warn!("Unable to get meta for {:?}: {}", candidate.path, e);
                item.metadata_read = false;
            }
        }

        Some(item)
    }
}

/// Creation time in seconds since the epoch, falling back to modification time
pub fn file_age(metadata: &fs::Metadata) -> f64 {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn join_relative(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Every directory under `root` as a sorted list of `/` separated relative paths
///
/// The root itself is listed as `""`, a missing root yields an empty list.
/// Stops early when `cancel` is set.
pub fn list_subdirectories(root: &Path, cancel: &AtomicBool) -> Result<Vec<String>> {
    if !root.is_dir() {
        debug!("Subdirectory root {:?} is not a directory", root);
        return Ok(Vec::new());
    }

    let mut dirs = vec![String::new()];
    for entry in WalkDir::new(root).min_depth(1).follow_links(true) {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping {:?}: {}", e.path(), e);
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            dirs.push(parts.join("/"));
        }
    }

    dirs.sort();
    Ok(dirs)
}

/// Names of the direct child directories of `root`, sorted
pub fn list_immediate_subdirectories(root: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(root).map_err(|e| NodeError::from(e).with_path(root))?;
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn write_png(path: &Path, w: u32, h: u32) {
        let frame = image::RgbImage::new(w, h);
        frame.save(path).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("b/deep")).unwrap();
        fs::create_dir_all(root.join("a")).unwrap();
        write_png(&root.join("z.png"), 4, 2);
        write_png(&root.join("a/one.png"), 3, 3);
        write_png(&root.join("b/deep/two.png"), 5, 1);
        fs::write(root.join("notes.txt"), b"ignored").unwrap();
        fs::write(root.join("a/broken.jpg"), b"not a jpeg").unwrap();
        dir
    }

    fn scanner(root: &Path, recursive: bool) -> SubdirectoryScanner {
        SubdirectoryScanner::new(
            root.to_path_buf(),
            recursive,
            ScanThresholds::default(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_flat_scan_only_lists_root() {
        let dir = fixture();
        let result = scanner(dir.path(), false).scan();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].item, "z.png");
        assert_eq!(result.items[0].dimensions, [4, 2]);
        assert_eq!(result.items[0].subdirectory, "");
        assert_eq!(result.total_dirs, 1);
    }

    #[test]
    fn test_recursive_scan_orders_by_subdirectory() {
        let dir = fixture();
        let result = scanner(dir.path(), true).scan();
        let paths: Vec<String> = result.items.iter().map(|i| i.relative_path()).collect();
        assert_eq!(
            paths,
            vec!["z.png", "a/broken.jpg", "a/one.png", "b/deep/two.png"]
        );
        assert_eq!(result.image_count, 4);
        assert_eq!(result.total_dirs, 4);
        assert!(!result.cancelled);
    }

    #[test]
    fn test_unreadable_metadata_is_flagged_not_fatal() {
        let dir = fixture();
        let result = scanner(dir.path(), true).scan();
        let broken = result.items.iter().find(|i| i.item == "broken.jpg").unwrap();
        assert!(!broken.metadata_read);
        assert_eq!(broken.dimensions, [0, 0]);
        assert_eq!(broken.format, "image/jpg");
    }

    #[test]
    fn test_cancelled_scan_returns_early() {
        let dir = fixture();
        let cancel = Arc::new(AtomicBool::new(true));
        let result = SubdirectoryScanner::new(
            dir.path().to_path_buf(),
            true,
            ScanThresholds::default(),
            cancel,
        )
        .scan();
        assert!(result.cancelled);
        assert!(result.items.is_empty());
    }

    #[test]
    fn test_wide_pool_path_matches_small_pool() {
        let dir = fixture();
        let thresholds = ScanThresholds {
            image_wide: 0,
            image_wide_recursive: 0,
            wide_pool_threads: 2,
            ..ScanThresholds::default()
        };
        let wide = SubdirectoryScanner::new(
            dir.path().to_path_buf(),
            true,
            thresholds,
            Arc::new(AtomicBool::new(false)),
        )
        .scan();
        let small = scanner(dir.path(), true).scan();
        assert_eq!(wide.items, small.items);
    }

    #[test]
    fn test_progress_reported_per_level() {
        let dir = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        scanner(dir.path(), true)
            .with_progress(Box::new(move |p| {
                sink.lock().unwrap().push(p.current_dir.clone());
            }))
            .scan();
        assert_eq!(*seen.lock().unwrap(), vec!["", "a", "b", "b/deep"]);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let result = scanner(Path::new("/definitely/not/here"), true).scan();
        assert!(result.items.is_empty());
        assert_eq!(result.total_dirs, 0);
    }

    #[test]
    fn test_list_subdirectories() {
        let dir = fixture();
        let cancel = AtomicBool::new(false);
        assert_eq!(
            list_subdirectories(dir.path(), &cancel).unwrap(),
            vec!["", "a", "b", "b/deep"]
        );
        assert_eq!(
            list_immediate_subdirectories(dir.path()).unwrap(),
            vec!["a", "b"]
        );
        assert!(list_subdirectories(&dir.path().join("nope"), &cancel)
            .unwrap()
            .is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directories_are_followed_once() {
        let dir = fixture();
        let root = dir.path();
        std::os::unix::fs::symlink(root.join("b/deep"), root.join("linked")).unwrap();
        std::os::unix::fs::symlink(root, root.join("a/loop")).unwrap();

        let result = scanner(root, true).scan();
        let paths: Vec<String> = result.items.iter().map(|i| i.relative_path()).collect();
        // `linked` and `a/loop` resolve to directories already scanned
        assert_eq!(
            paths,
            vec!["z.png", "a/broken.jpg", "a/one.png", "b/deep/two.png"]
        );
        assert!(!result.cancelled);

        let cancel = AtomicBool::new(false);
        let dirs = list_subdirectories(root, &cancel).unwrap();
        assert!(dirs.contains(&"linked".to_string()));
        assert!(!dirs.iter().any(|d| d.starts_with("a/loop")));
    }
}
