//! Video containers: ffprobe parsing and a raw comment scan fallback

use log::debug;
use serde_json::Value;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Command;

use crate::error::{NodeError, Result};

/// Bytes read from each end of a file by the raw comment scan
const RAW_SCAN_WINDOW: u64 = 4 * 1024 * 1024;

const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const EBML_TAG_STRING: [u8; 2] = [0x44, 0x87];
const MP4_COMMENT_ATOM: [u8; 4] = [0xA9, b'c', b'm', b't'];

/// Video stream properties reported by ffprobe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub frame_count: Option<i64>,
    pub fps: Option<f64>,
    pub duration: Option<f64>,
    pub comment: Option<String>,
}

/// Run ffprobe on a file
pub fn probe(path: &Path, ffprobe: &Path) -> Result<VideoProbe> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|e| NodeError::subprocess(format!("Failed to run {:?}: {}", ffprobe, e)))?;

    if !output.status.success() {
        return Err(NodeError::subprocess(format!(
            "ffprobe exited with {} for {:?}",
            output.status, path
        )));
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
        .map_err(|e| e.with_path(path))
}

/// Parse the JSON printed by `ffprobe -show_format -show_streams`
pub fn parse_probe_output(json: &str) -> Result<VideoProbe> {
    let parsed: Value = serde_json::from_str(json)?;
    let format = parsed.get("format");
    let stream = parsed
        .get("streams")
        .and_then(|s| s.as_array())
        .and_then(|streams| {
            streams
                .iter()
                .find(|st| st.get("codec_type").and_then(|t| t.as_str()) == Some("video"))
        })
        .ok_or_else(|| NodeError::decode(None, "No video stream"))?;

    let get_u32 = |key: &str| -> u32 {
        stream
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(0)
    };

    let fps = stream
        .get("avg_frame_rate")
        .and_then(|r| r.as_str())
        .and_then(parse_rate)
        .or_else(|| {
            stream
                .get("r_frame_rate")
                .and_then(|r| r.as_str())
                .and_then(parse_rate)
        });

    let duration = stream
        .get("duration")
        .or_else(|| format.and_then(|f| f.get("duration")))
        .and_then(as_f64_lenient);

    let frame_count = stream
        .get("nb_frames")
        .and_then(as_f64_lenient)
        .map(|n| n as i64)
        .filter(|n| *n > 0)
        .or_else(|| match (duration, fps) {
            (Some(d), Some(f)) => Some((d * f).round() as i64),
            _ => None,
        });

    let comment = format
        .and_then(|f| f.get("tags"))
        .and_then(|t| t.as_object())
        .and_then(|tags| {
            tags.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("comment"))
                .and_then(|(_, v)| v.as_str())
                .map(|s| s.to_string())
        });

    Ok(VideoProbe {
        width: get_u32("width"),
        height: get_u32("height"),
        frame_count,
        fps,
        duration,
        comment,
    })
}

/// Parse an ffprobe rate such as `30000/1001`
fn parse_rate(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if num == 0.0 || den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => s.trim().parse().ok().filter(|v: &f64| *v > 0.0),
    }
}

fn as_f64_lenient(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Read a file and look for an embedded comment without ffprobe
///
/// Only the head and tail windows are read. WebM tags and the MP4 `moov`
/// atom sit at one end or the other.
pub fn scan_file_comment(path: &Path) -> Result<Option<String>> {
    let mut file = std::fs::File::open(path).map_err(|e| NodeError::from(e).with_path(path))?;
    let size = file.metadata()?.len();

    let mut head = Vec::new();
    (&mut file).take(RAW_SCAN_WINDOW).read_to_end(&mut head)?;
    let container = Container::detect(&head);
    if let Some(comment) = container.scan(&head) {
        return Ok(Some(comment));
    }
    if container == Container::Unknown || size <= RAW_SCAN_WINDOW {
        return Ok(None);
    }

    let tail_start = size.saturating_sub(RAW_SCAN_WINDOW).max(RAW_SCAN_WINDOW);
    debug!("Scanning tail of {:?} from byte {}", path, tail_start);
    file.seek(SeekFrom::Start(tail_start))?;
    let mut tail = Vec::new();
    file.take(RAW_SCAN_WINDOW).read_to_end(&mut tail)?;
    Ok(container.scan(&tail))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Webm,
    Mp4,
    Unknown,
}

impl Container {
    fn detect(head: &[u8]) -> Self {
        if head.starts_with(&WEBM_MAGIC) {
            Container::Webm
        } else if head.len() >= 12 && &head[4..8] == b"ftyp" {
            Container::Mp4
        } else {
            Container::Unknown
        }
    }

    fn scan(self, data: &[u8]) -> Option<String> {
        match self {
            Container::Webm => scan_webm_comment(data),
            Container::Mp4 => scan_mp4_comment(data),
            Container::Unknown => None,
        }
    }
}

/// Look for a comment in WebM/Matroska or MP4 bytes
///
/// WebM: a `COMMENT` tag name followed by its `TagString` element.
/// MP4: the last `data` atom nested in a `©cmt` atom.
pub fn scan_container_comment(data: &[u8]) -> Option<String> {
    Container::detect(data).scan(data)
}

fn scan_webm_comment(data: &[u8]) -> Option<String> {
    let mut from = 0;
    while let Some(found) = find(&data[from..], b"COMMENT") {
        let pos = from + found + b"COMMENT".len();
        if data.get(pos..pos + 2) == Some(&EBML_TAG_STRING[..]) {
            let (length, width) = read_vint(&data[pos + 2..])?;
            let start = pos + 2 + width;
            let end = start.checked_add(length as usize)?;
            let bytes = data.get(start..end)?;
            return Some(String::from_utf8_lossy(bytes).into_owned());
        }
        from = pos;
    }
    None
}

/// EBML variable-size integer: value and encoded width
fn read_vint(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    if first == 0 {
        return None;
    }
    let width = first.leading_zeros() as usize + 1;
    // width 8 leaves no value bits in the first byte
    let mut value = (first & 0xFFu8.checked_shr(width as u32).unwrap_or(0)) as u64;
    for byte in data.get(1..width)? {
        value = (value << 8) | *byte as u64;
    }
    Some((value, width))
}

fn scan_mp4_comment(data: &[u8]) -> Option<String> {
    let mut end = data.len();
    while let Some(pos) = rfind(&data[..end], b"data") {
        if pos >= 8 && data[pos - 8..pos - 4] == MP4_COMMENT_ATOM {
            let size = u32::from_be_bytes(data[pos - 4..pos].try_into().ok()?) as usize;
            // size, "data", type, locale
            let content_len = size.checked_sub(16)?;
            let start = pos + 12;
            let bytes = data.get(start..start + content_len)?;
            return Some(String::from_utf8_lossy(bytes).into_owned());
        }
        end = pos;
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "sample_rate": "44100"},
                {"codec_type": "video", "width": 640, "height": 360,
                 "avg_frame_rate": "30000/1001", "r_frame_rate": "30/1", "nb_frames": "120"}
            ],
            "format": {"duration": "4.004", "tags": {"COMMENT": "{\"seed\": 1}"}}
        }"#;
        let probe = parse_probe_output(json).unwrap();
        assert_eq!((probe.width, probe.height), (640, 360));
        assert_eq!(probe.frame_count, Some(120));
        assert!((probe.fps.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(probe.comment.as_deref(), Some("{\"seed\": 1}"));
    }

    #[test]
    fn test_frame_count_from_duration() {
        let json = r#"{
            "streams": [{"codec_type": "video", "width": 8, "height": 8,
                         "avg_frame_rate": "0/0", "r_frame_rate": "25/1"}],
            "format": {"duration": "2.0"}
        }"#;
        let probe = parse_probe_output(json).unwrap();
        assert_eq!(probe.fps, Some(25.0));
        assert_eq!(probe.frame_count, Some(50));
        assert_eq!(probe.comment, None);
    }

    #[test]
    fn test_no_video_stream() {
        assert!(parse_probe_output(r#"{"streams": []}"#).is_err());
    }

    #[test]
    fn test_scan_webm_comment() {
        let mut data = WEBM_MAGIC.to_vec();
        data.extend_from_slice(b"\x00\x00junk\x45\xA3\x87COMMENT");
        data.extend_from_slice(&EBML_TAG_STRING);
        data.push(0x80 | 5);
        data.extend_from_slice(b"hello tail");
        assert_eq!(scan_container_comment(&data).as_deref(), Some("hello"));
    }

    #[test]
    fn test_scan_mp4_comment() {
        let text = b"{\"a\": 1}";
        let mut data = vec![0, 0, 0, 16];
        data.extend_from_slice(b"ftypisom");
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&((text.len() + 24) as u32).to_be_bytes());
        data.extend_from_slice(&MP4_COMMENT_ATOM);
        data.extend_from_slice(&((text.len() + 16) as u32).to_be_bytes());
        data.extend_from_slice(b"data");
        data.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0]);
        data.extend_from_slice(text);
        assert_eq!(scan_container_comment(&data).as_deref(), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_vint_widths() {
        assert_eq!(read_vint(&[0x85]), Some((5, 1)));
        assert_eq!(read_vint(&[0x40, 0x02]), Some((2, 2)));
        assert_eq!(read_vint(&[0x00]), None);
        assert_eq!(read_vint(&[0x01, 0, 0, 0, 0, 0, 0, 3]), Some((3, 8)));
        assert_eq!(read_vint(&[0x01, 0, 0]), None);
    }

    #[test]
    fn test_scan_webm_comment_with_eight_byte_length() {
        let mut data = WEBM_MAGIC.to_vec();
        data.extend_from_slice(b"COMMENT");
        data.extend_from_slice(&EBML_TAG_STRING);
        data.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 3]);
        data.extend_from_slice(b"abc");
        assert_eq!(scan_container_comment(&data).as_deref(), Some("abc"));

        let mut truncated = WEBM_MAGIC.to_vec();
        truncated.extend_from_slice(b"COMMENT");
        truncated.extend_from_slice(&EBML_TAG_STRING);
        truncated.extend_from_slice(&[0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(scan_container_comment(&truncated), None);
    }

    fn webm_with_comment(comment: &[u8]) -> Vec<u8> {
        let mut data = b"COMMENT".to_vec();
        data.extend_from_slice(&EBML_TAG_STRING);
        data.push(0x80 | comment.len() as u8);
        data.extend_from_slice(comment);
        data
    }

    #[test]
    fn test_scan_file_comment_reads_tail_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.webm");
        let mut data = WEBM_MAGIC.to_vec();
        data.resize((RAW_SCAN_WINDOW * 2 + 1024) as usize, 0);
        data.extend_from_slice(&webm_with_comment(b"{\"seed\": 9}"));
        std::fs::write(&path, &data).unwrap();
        assert_eq!(scan_file_comment(&path).unwrap().as_deref(), Some("{\"seed\": 9}"));

        let head_path = dir.path().join("head.webm");
        let mut head = WEBM_MAGIC.to_vec();
        head.extend_from_slice(&webm_with_comment(b"front"));
        head.resize((RAW_SCAN_WINDOW * 3) as usize, 0);
        std::fs::write(&head_path, &head).unwrap();
        assert_eq!(scan_file_comment(&head_path).unwrap().as_deref(), Some("front"));
    }

    #[test]
    fn test_scan_file_comment_skips_middle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("middle.webm");
        let mut data = WEBM_MAGIC.to_vec();
        data.resize((RAW_SCAN_WINDOW + 1024) as usize, 0);
        data.extend_from_slice(&webm_with_comment(b"hidden"));
        data.resize((RAW_SCAN_WINDOW * 3) as usize, 0);
        std::fs::write(&path, &data).unwrap();
        assert_eq!(scan_file_comment(&path).unwrap(), None);

        let other = dir.path().join("plain.bin");
        std::fs::write(&other, b"not a container").unwrap();
        assert_eq!(scan_file_comment(&other).unwrap(), None);
    }
}
