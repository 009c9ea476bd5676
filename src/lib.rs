//! Media node toolkit and local backend
//!
//! Node functions for prompts, selectors, frame loading and saving, plus
//! the HTTP backend the front-end extensions talk to. Directory scans run
//! in parallel with rayon and walkdir.

pub mod config;
pub mod error;
pub mod familiar;
pub mod folders;
pub mod media;
pub mod metadata;
pub mod models;
pub mod output;
pub mod progress;
pub mod prompts;
pub mod scanner;
pub mod selectors;
pub mod server;
pub mod settings;
pub mod strategy;

pub use config::{BackendConfig, ScanThresholds, ToolPaths};
pub use error::{NodeError, NodeErrorKind, Result};
pub use folders::FolderPaths;
pub use metadata::MetadataExtractor;
pub use models::{MediaItem, MediaType, ScanResult};
pub use output::{save_video, SaveVideoOptions, SavedPreview, VideoFormats};
pub use progress::{ProgressEvent, ProgressLine, ProgressReporter, ScanPhase};
pub use scanner::{ScanProgress, SubdirectoryScanner};
pub use settings::SettingsStore;
pub use strategy::ConcurrencyStrategy;
