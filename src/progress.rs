//! JSON-lines progress reporting for the command-line scan
//!
//! Every line carries a sequence number, a timestamp and one event tagged
//! by `_t`. Lines go to stderr so stdout stays free for the scan result.

use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::NodeError;
use crate::models::ScanResult;
use crate::scanner::ScanProgress;

/// Scan phase indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    /// Walking directory levels
    #[default]
    Scan,
    Done,
}

/// One reported event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "_t")]
pub enum ProgressEvent {
    #[serde(rename = "start")]
    Start { root: String, recursive: bool },

    /// Sent after a directory level, at most once per interval
    #[serde(rename = "p")]
    Progress {
        phase: ScanPhase,
        /// Items accepted so far
        #[serde(rename = "f")]
        files: u64,
        #[serde(rename = "d")]
        dirs: u64,
        #[serde(rename = "v")]
        videos: u64,
        #[serde(rename = "i")]
        images: u64,
        /// Directory just processed, relative to the root
        dir: String,
        ms: u64,
    },

    #[serde(rename = "err")]
    Error {
        /// Error kind name
        error_type: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },

    #[serde(rename = "done")]
    Done {
        #[serde(rename = "tf")]
        items: u64,
        #[serde(rename = "td")]
        dirs: u64,
        #[serde(rename = "v")]
        videos: u64,
        #[serde(rename = "i")]
        images: u64,
        cancelled: bool,
        #[serde(rename = "ec")]
        errors: usize,
        ms: u64,
    },
}

impl ProgressEvent {
    pub fn progress(progress: &ScanProgress) -> Self {
        ProgressEvent::Progress {
            phase: ScanPhase::Scan,
            files: progress.scanned_files,
            dirs: progress.scanned_dirs,
            videos: progress.video_count,
            images: progress.image_count,
            dir: progress.current_dir.clone(),
            ms: progress.elapsed_ms,
        }
    }

    pub fn error(error: &NodeError) -> Self {
        ProgressEvent::Error {
            error_type: format!("{:?}", error.kind),
            message: error.message.clone(),
            path: error.path.as_ref().map(|p| p.to_string_lossy().into_owned()),
        }
    }

    pub fn done(result: &ScanResult) -> Self {
        ProgressEvent::Done {
            items: result.items.len() as u64,
            dirs: result.total_dirs,
            videos: result.video_count,
            images: result.image_count,
            cancelled: result.cancelled,
            errors: result.error_count(),
            ms: result.duration_ms,
        }
    }
}

/// A serialized line: sequence number, timestamp and the event fields
#[derive(Debug, Clone, Serialize)]
pub struct ProgressLine {
    pub seq: u64,
    /// Milliseconds since reporter creation
    pub ts: u64,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Writes progress lines to stderr
///
/// Shared between the scan thread and the progress callback, so the
/// throttling clock sits behind a mutex.
pub struct ProgressReporter {
    enabled: bool,
    /// Minimum interval between progress events in milliseconds
    interval_ms: u64,
    last_progress: Mutex<Option<Instant>>,
    seq: AtomicU64,
    started: Instant,
}

impl ProgressReporter {
    pub fn new(enabled: bool, interval_ms: u64) -> Self {
        Self {
            enabled,
            interval_ms,
            last_progress: Mutex::new(None),
            seq: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True when the interval has elapsed since the last progress event
    pub fn should_report(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_progress.lock() {
            Ok(last) => last.map_or(true, |t| t.elapsed().as_millis() as u64 >= self.interval_ms),
            Err(_) => false,
        }
    }

    /// Number the event and stamp it, without writing it
    pub fn line(&self, event: ProgressEvent) -> ProgressLine {
        ProgressLine {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            ts: self.started.elapsed().as_millis() as u64,
            event,
        }
    }

    /// Write an event unless reporting is disabled
    pub fn emit(&self, event: ProgressEvent) {
        if !self.enabled {
            return;
        }
        if let Ok(json) = serde_json::to_string(&self.line(event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", json);
            let _ = stderr.flush();
        }
    }

    pub fn report_start(&self, root: &Path, recursive: bool) {
        self.emit(ProgressEvent::Start {
            root: root.to_string_lossy().into_owned(),
            recursive,
        });
    }

    /// Report scan progress, returning whether a line was written
    pub fn report_progress(&self, progress: &ScanProgress) -> bool {
        if !self.should_report() {
            return false;
        }
        self.emit(ProgressEvent::progress(progress));
        if let Ok(mut last) = self.last_progress.lock() {
            *last = Some(Instant::now());
        }
        true
    }

    /// Errors are written immediately, ignoring the interval
    pub fn report_error(&self, error: &NodeError) {
        self.emit(ProgressEvent::error(error));
    }

    pub fn report_done(&self, result: &ScanResult) {
        self.emit(ProgressEvent::done(result));
    }
}
