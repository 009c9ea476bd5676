//! Model items and their familiar files
//!
//! A familiar file sits next to a model and contains the model's base name
//! in its own stem: preview images, `.info` / `.txt` notes, a `.json` config.

use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{NodeError, Result};
use crate::folders::{is_contained, FolderPaths};
use crate::metadata::parse_json_or_string;
use crate::scanner::file_age;

/// Extensions of familiar preview images
pub const FAMILIAR_IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Extensions of familiar text files
pub const FAMILIAR_INFO_EXTENSIONS: &[&str] = &["info", "txt", "json"];

/// One model and the familiar files found beside it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamiliarRecord {
    /// Subdirectory of the model inside its model folder, `None` at the top
    pub containing_directory: Option<String>,
    /// Name as listed for the model type, extension included
    pub full_name: String,
    /// Creation time as seconds since the epoch
    pub file_age: f64,
    /// Extension with the leading dot
    pub file_ext: String,
    /// Familiar images, prefixed by `containing_directory`
    pub familiar_images: Vec<String>,
    /// Text of each familiar info file, or its name when unreadable
    pub familiar_infos: Vec<String>,
}

/// Collect the familiar files of every model of a type
///
/// Keys are model base names. Directory listings are shared between models
/// in the same folder. Setting `cancel` stops early with what was gathered.
pub fn create_familiar_dictionaries(
    folders: &FolderPaths,
    model_type: &str,
    cancel: &AtomicBool,
) -> Result<BTreeMap<String, FamiliarRecord>> {
    let names = folders.filename_list(model_type)?;
    let mut listings: HashMap<PathBuf, Vec<String>> = HashMap::new();
    let mut records = BTreeMap::new();

    for full_name in names {
        if cancel.load(Ordering::Relaxed) {
            debug!("Familiar lookup for {} cancelled", model_type);
            break;
        }

        let model_path = match folders.full_path(model_type, &full_name) {
            Some(path) => path,
            None => {
                warn!("Unable to get path for {} {}", model_type, full_name);
                continue;
            }
        };
        let parent = match model_path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => continue,
        };

        let (containing_directory, file_name) = match full_name.rsplit_once('/') {
            Some((dir, name)) => (Some(dir.to_string()), name),
            None => (None, full_name.as_str()),
        };
        let (base_name, file_ext) = split_extension(file_name);

        let listing = listings
            .entry(parent.clone())
            .or_insert_with(|| list_file_names(&parent));

        let age = fs::metadata(&model_path)
            .map(|m| file_age(&m))
            .unwrap_or(0.0);

        let familiar_images = find_familiars(listing, base_name, FAMILIAR_IMAGE_EXTENSIONS)
            .into_iter()
            .map(|name| prefixed(containing_directory.as_deref(), &name))
            .collect();
        let familiar_infos = sorted(
            find_familiars(listing, base_name, FAMILIAR_INFO_EXTENSIONS)
                .into_iter()
                .map(|name| match fs::read_to_string(parent.join(&name)) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Unable to read {:?}, using its name: {}", name, e);
                        prefixed(containing_directory.as_deref(), &name)
                    }
                })
                .collect(),
        );

        records.insert(
            base_name.to_string(),
            FamiliarRecord {
                containing_directory,
                file_ext: file_ext.to_string(),
                full_name: full_name.clone(),
                file_age: age,
                familiar_images,
                familiar_infos,
            },
        );
    }

    Ok(records)
}

fn list_file_names(dir: &Path) -> Vec<String> {
    match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect(),
        Err(e) => {
            warn!("Unable to list {:?}: {}", dir, e);
            Vec::new()
        }
    }
}

/// Names in `listing` with one of `extensions` whose stem contains `base_name`, sorted
fn find_familiars(listing: &[String], base_name: &str, extensions: &[&str]) -> Vec<String> {
    sorted(
        listing
            .iter()
            .filter(|name| {
                let (stem, ext) = split_extension(name);
                let ext = ext.trim_start_matches('.').to_lowercase();
                extensions.contains(&ext.as_str()) && stem.contains(base_name)
            })
            .cloned()
            .collect(),
    )
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items
}

fn prefixed(containing_directory: Option<&str>, name: &str) -> String {
    match containing_directory {
        Some(dir) => format!("{}/{}", dir, name),
        None => name.to_string(),
    }
}

/// Split `name.ext` into `("name", ".ext")`; a leading dot is part of the stem
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(pos) => name.split_at(pos),
    }
}

/// Merge `key = value` into the `<stem>.json` beside a model
///
/// The value is stored as JSON when it parses as JSON. Returns the updated
/// config object.
pub fn save_model_config(
    folders: &FolderPaths,
    model_type: &str,
    item_name: &str,
    subfolder: Option<&str>,
    key: &str,
    value: &str,
) -> Result<Map<String, Value>> {
    let name = match subfolder {
        Some(sub) if !sub.is_empty() => format!("{}/{}", sub.trim_end_matches('/'), item_name),
        _ => item_name.to_string(),
    };
    let model_path = folders.full_path(model_type, &name).ok_or_else(|| {
        NodeError::not_found(PathBuf::from(format!("{}/{}", model_type, name)))
    })?;

    let file_name = model_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NodeError::invalid_path(&model_path, "Model name is not valid UTF-8"))?;
    let (stem, _) = split_extension(file_name);
    let config_path = model_path.with_file_name(format!("{}.json", stem));

    let mut config = match fs::read_to_string(&config_path) {
        Ok(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            _ => {
                warn!("Replacing unreadable model config {:?}", config_path);
                Map::new()
            }
        },
        Err(_) => Map::new(),
    };
    config.insert(key.to_string(), parse_json_or_string(value));

    let text = serde_json::to_string_pretty(&config)?;
    fs::write(&config_path, text).map_err(|e| NodeError::from(e).with_path(&config_path))?;
    Ok(config)
}

/// Read a text file that sits in the top-level folder of a model type
pub fn load_info(folders: &FolderPaths, model_type: &str, filename: &str) -> Result<String> {
    if filename.starts_with('/') || filename.contains("..") || !is_contained(Path::new(filename))
    {
        return Err(NodeError::invalid_path(filename, "Path escapes the model folder"));
    }

    let names = folders.filename_list(model_type)?;
    let base_dir = names
        .iter()
        .filter(|name| !name.contains('/'))
        .filter_map(|name| folders.full_path(model_type, name))
        .last()
        .and_then(|path| path.parent().map(Path::to_path_buf))
        .ok_or_else(|| {
            NodeError::not_found(PathBuf::from(model_type))
        })?;

    let file = base_dir.join(filename);
    if !file.is_file() {
        return Err(NodeError::not_found(file));
    }
    fs::read_to_string(&file).map_err(|e| NodeError::from(e).with_path(&file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn setup() -> (tempfile::TempDir, FolderPaths) {
        let dir = tempfile::tempdir().unwrap();
        let loras = dir.path().join("models/loras");
        fs::create_dir_all(loras.join("style")).unwrap();
        fs::write(loras.join("cat.safetensors"), b"").unwrap();
        fs::write(loras.join("cat.preview.png"), b"").unwrap();
        fs::write(loras.join("cat.png"), b"").unwrap();
        fs::write(loras.join("cat.info"), b"{\"trained\": \"cat\"}").unwrap();
        fs::write(loras.join("dog.png"), b"").unwrap();
        fs::write(loras.join("style/ink.safetensors"), b"").unwrap();
        fs::write(loras.join("style/ink.webp"), b"").unwrap();
        fs::write(loras.join("style/ink.txt"), b"ink notes").unwrap();

        let config = BackendConfig::builder()
            .comfy_root(dir.path().to_path_buf())
            .build();
        let folders = FolderPaths::new(&config);
        (dir, folders)
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("a.safetensors"), ("a", ".safetensors"));
        assert_eq!(split_extension("a.b.png"), ("a.b", ".png"));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
        assert_eq!(split_extension("plain"), ("plain", ""));
    }

    #[test]
    fn test_familiar_dictionaries() {
        let (_dir, folders) = setup();
        let records =
            create_familiar_dictionaries(&folders, "loras", &AtomicBool::new(false)).unwrap();

        assert_eq!(records.len(), 2);
        let cat = &records["cat"];
        assert_eq!(cat.containing_directory, None);
        assert_eq!(cat.full_name, "cat.safetensors");
        assert_eq!(cat.file_ext, ".safetensors");
        assert_eq!(cat.familiar_images, vec!["cat.png", "cat.preview.png"]);
        assert_eq!(cat.familiar_infos, vec!["{\"trained\": \"cat\"}"]);

        let ink = &records["ink"];
        assert_eq!(ink.containing_directory.as_deref(), Some("style"));
        assert_eq!(ink.familiar_images, vec!["style/ink.webp"]);
        assert_eq!(ink.familiar_infos, vec!["ink notes"]);
    }

    #[test]
    fn test_cancelled_lookup_is_empty() {
        let (_dir, folders) = setup();
        let records =
            create_familiar_dictionaries(&folders, "loras", &AtomicBool::new(true)).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_save_model_config_merges_keys() {
        let (dir, folders) = setup();
        save_model_config(&folders, "loras", "ink.safetensors", Some("style"), "weight", "0.8")
            .unwrap();
        let config =
            save_model_config(&folders, "loras", "ink.safetensors", Some("style"), "note", "soft")
                .unwrap();

        assert_eq!(config["weight"], 0.8);
        assert_eq!(config["note"], "soft");
        let on_disk = fs::read_to_string(dir.path().join("models/loras/style/ink.json")).unwrap();
        assert!(on_disk.contains("\"weight\""));

        assert!(save_model_config(&folders, "loras", "missing.pt", None, "k", "v").is_err());
    }

    #[test]
    fn test_load_info() {
        let (_dir, folders) = setup();
        assert_eq!(
            load_info(&folders, "loras", "cat.info").unwrap(),
            "{\"trained\": \"cat\"}"
        );
        assert!(load_info(&folders, "loras", "../secret").is_err());
        assert!(load_info(&folders, "loras", "/etc/passwd").is_err());
        assert!(load_info(&folders, "loras", "nope.txt").is_err());
    }
}
