//! Frame timing and size of loaded media

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timing and size of a frame sequence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub start_frame: u64,
    pub frame_count: u64,
    pub fps: f64,
    /// Seconds, `frame_count / fps`
    pub duration: f64,
    /// Seconds per frame, `1 / fps`
    pub frame_time: f64,
    pub width: u32,
    pub height: u32,
}

impl MediaInfo {
    /// Derive duration and frame time from the frame rate
    ///
    /// A rate of zero or less leaves both at 0.
    pub fn new(start_frame: u64, frame_count: u64, fps: f64, width: u32, height: u32) -> Self {
        let (duration, frame_time) = if fps > 0.0 {
            (frame_count as f64 / fps, 1.0 / fps)
        } else {
            (0.0, 0.0)
        };
        Self {
            start_frame,
            frame_count,
            fps,
            duration,
            frame_time,
            width,
            height,
        }
    }

    /// JSON indented by four spaces
    pub fn to_json_string(&self) -> Result<String> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Every field in declaration order
    pub fn break_down(&self) -> (u64, u64, f64, f64, f64, u32, u32) {
        (
            self.start_frame,
            self.frame_count,
            self.fps,
            self.duration,
            self.frame_time,
            self.width,
            self.height,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_timing() {
        let info = MediaInfo::new(3, 50, 25.0, 640, 360);
        assert_eq!(info.duration, 2.0);
        assert_eq!(info.frame_time, 0.04);
        assert_eq!(info.break_down(), (3, 50, 25.0, 2.0, 0.04, 640, 360));

        let still = MediaInfo::new(0, 1, 0.0, 1, 1);
        assert_eq!((still.duration, still.frame_time), (0.0, 0.0));
    }

    #[test]
    fn test_json_string() {
        let text = MediaInfo::new(0, 10, 10.0, 2, 4).to_json_string().unwrap();
        assert!(text.starts_with("{\n    \"start_frame\": 0,"));
        assert!(text.contains("\"fps\": 10.0"));
        let back: MediaInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(back.height, 4);
    }
}
