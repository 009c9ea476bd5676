//! Host directory layout and model folder registry
//!
//! Relative paths resolve against the host root. Model types map to one or
//! more directories whose files are listed recursively with `/` separators.

use log::debug;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::BackendConfig;
use crate::error::{NodeError, Result};

/// Extensions of files listed as models
pub const MODEL_EXTENSIONS: &[&str] = &["ckpt", "pt", "pt2", "bin", "pth", "safetensors", "pkl", "sft"];

/// Resolves host directories and model files
#[derive(Debug, Clone)]
pub struct FolderPaths {
    comfy_root: PathBuf,
    model_folders: BTreeMap<String, Vec<PathBuf>>,
}

impl FolderPaths {
    /// Build from the backend configuration
    pub fn new(config: &BackendConfig) -> Self {
        let comfy_root = config.comfy_root.clone();
        let model_folders = config
            .model_folders
            .iter()
            .map(|(name, dirs)| {
                let resolved = dirs
                    .iter()
                    .map(|d| resolve_against(&comfy_root, d))
                    .collect();
                (name.clone(), resolved)
            })
            .collect();
        Self {
            comfy_root,
            model_folders,
        }
    }

    /// Host root directory
    pub fn comfy_root(&self) -> &Path {
        &self.comfy_root
    }

    /// Resolve a path relative to the host root
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.comfy_root.join(relative)
    }

    /// Keep absolute paths, resolve relative ones against the host root
    pub fn resolve_file_path(&self, path: impl AsRef<Path>) -> PathBuf {
        resolve_against(&self.comfy_root, path.as_ref())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve("output")
    }

    pub fn input_dir(&self) -> PathBuf {
        self.resolve("input")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.resolve("temp")
    }

    /// Directory for an upload or output type (`output`, `input`, `temp`)
    pub fn directory_by_type(&self, kind: &str) -> Option<PathBuf> {
        match kind {
            "output" => Some(self.output_dir()),
            "input" => Some(self.input_dir()),
            "temp" => Some(self.temp_dir()),
            _ => None,
        }
    }

    /// Registered model types
    pub fn model_types(&self) -> impl Iterator<Item = &String> {
        self.model_folders.keys()
    }

    /// Directories registered for a model type
    pub fn folders(&self, model_type: &str) -> Option<&[PathBuf]> {
        self.model_folders.get(model_type).map(|v| v.as_slice())
    }

    /// Every model file under the directories of a model type, `/` separated and sorted
    pub fn filename_list(&self, model_type: &str) -> Result<Vec<String>> {
        let folders = self.folders(model_type).ok_or_else(|| {
            NodeError::invalid_input(format!("Unknown model type: {}", model_type))
        })?;

        let mut names = Vec::new();
        for folder in folders {
            if !folder.is_dir() {
                debug!("Model folder {:?} does not exist", folder);
                continue;
            }
            for entry in WalkDir::new(folder).min_depth(1).follow_links(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping {:?}: {}", e.path(), e);
                        continue;
                    }
                };
                let is_model = entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| MODEL_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false);
                if !entry.file_type().is_file() || !is_model {
                    continue;
                }
                if let Ok(relative) = entry.path().strip_prefix(folder) {
                    names.push(to_slash(relative));
                }
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Full path of a model file, searching the type's directories in order
    pub fn full_path(&self, model_type: &str, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        if !is_contained(relative) {
            return None;
        }
        self.folders(model_type)?
            .iter()
            .map(|folder| folder.join(relative))
            .find(|candidate| candidate.is_file())
    }

    /// Base directory of a model type, or of a host-relative folder
    ///
    /// For registered types this is the common ancestor of the first two
    /// model files, falling back to the first registered directory.
    pub fn base_dir(&self, kind: &str) -> Option<PathBuf> {
        match self.folders(kind) {
            Some(folders) => {
                let sample: Vec<PathBuf> = self
                    .filename_list(kind)
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|name| self.full_path(kind, name))
                    .take(2)
                    .collect();
                if sample.len() == 2 {
                    Some(highest_common_folder(&sample[0], &sample[1]))
                } else {
                    folders.first().cloned()
                }
            }
            None => Some(self.resolve(kind)),
        }
    }
}

fn resolve_against(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Longest shared leading directory of two paths
pub fn highest_common_folder(a: &Path, b: &Path) -> PathBuf {
    a.components()
        .zip(b.components())
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x.as_os_str())
        .collect()
}

/// True when a relative path stays below the directory it is joined to
pub fn is_contained(relative: &Path) -> bool {
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Render a relative path with `/` separators
pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, FolderPaths) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("models/loras/style")).unwrap();
        fs::create_dir_all(root.join("extra")).unwrap();
        fs::write(root.join("models/loras/b.safetensors"), b"").unwrap();
        fs::write(root.join("models/loras/style/a.safetensors"), b"").unwrap();
        fs::write(root.join("extra/c.safetensors"), b"").unwrap();
        fs::write(root.join("extra/c.png"), b"").unwrap();

        let config = BackendConfig::builder()
            .comfy_root(root.to_path_buf())
            .add_model_folder("loras", root.join("extra"))
            .build();
        let folders = FolderPaths::new(&config);
        (dir, folders)
    }

    #[test]
    fn test_filename_list_is_sorted_and_slash_separated() {
        let (_dir, folders) = setup();
        assert_eq!(
            folders.filename_list("loras").unwrap(),
            vec!["b.safetensors", "c.safetensors", "style/a.safetensors"]
        );
        assert!(folders.filename_list("nope").is_err());
        assert!(folders.filename_list("vae").unwrap().is_empty());
    }

    #[test]
    fn test_full_path_searches_folders_in_order() {
        let (dir, folders) = setup();
        assert_eq!(
            folders.full_path("loras", "c.safetensors"),
            Some(dir.path().join("extra/c.safetensors"))
        );
        assert_eq!(
            folders.full_path("loras", "style/a.safetensors"),
            Some(dir.path().join("models/loras/style/a.safetensors"))
        );
        assert_eq!(folders.full_path("loras", "../extra/c.safetensors"), None);
    }

    #[test]
    fn test_base_dir() {
        let (dir, folders) = setup();
        assert_eq!(folders.base_dir("loras"), Some(dir.path().to_path_buf()));
        assert_eq!(folders.base_dir("output"), Some(dir.path().join("output")));
        assert_eq!(folders.base_dir("vae"), Some(dir.path().join("models/vae")));
    }

    #[test]
    fn test_resolve_file_path() {
        let (dir, folders) = setup();
        assert_eq!(folders.resolve_file_path("/abs/x.txt"), PathBuf::from("/abs/x.txt"));
        assert_eq!(folders.resolve_file_path("rel/x.txt"), dir.path().join("rel/x.txt"));
        assert_eq!(folders.directory_by_type("input"), Some(dir.path().join("input")));
        assert_eq!(folders.directory_by_type("models"), None);
    }

    #[test]
    fn test_highest_common_folder() {
        assert_eq!(
            highest_common_folder(Path::new("/a/b/c/x"), Path::new("/a/b/d/y")),
            PathBuf::from("/a/b")
        );
        assert_eq!(
            highest_common_folder(Path::new("a/x"), Path::new("b/y")),
            PathBuf::new()
        );
    }

    #[test]
    fn test_is_contained() {
        assert!(is_contained(Path::new("a/b.png")));
        assert!(is_contained(Path::new("./a.png")));
        assert!(!is_contained(Path::new("../a.png")));
        assert!(!is_contained(Path::new("/etc/passwd")));
    }
}
