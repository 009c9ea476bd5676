//! Loading frames from images, animations and videos
//!
//! Still and animated images decode in process. Videos are probed with
//! ffprobe and decoded through an ffmpeg `rawvideo` pipe.

use image::codecs::gif::GifDecoder;
use image::codecs::png::PngDecoder;
use image::codecs::webp::WebPDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, Frame, ImageDecoder, ImageReader, RgbImage};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use walkdir::WalkDir;

use super::MediaInfo;
use crate::config::{extension_of, ToolPaths};
use crate::error::{NodeError, Result};
use crate::metadata::video;
use crate::models::MediaType;

/// Frame rate reported for single images and animations without delays
pub const STILL_FPS: f64 = 1.0;

/// Unit of a frame position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Frames,
    Seconds,
}

impl TimeUnit {
    /// Convert `n` of this unit into frames, truncating
    pub fn to_frames(&self, n: u64, fps: f64) -> u64 {
        match self {
            TimeUnit::Frames => n,
            TimeUnit::Seconds => (n as f64 * fps.max(0.0)) as u64,
        }
    }
}

/// Which frames of a sequence to keep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSelection {
    /// First frame to keep
    pub start_at: u64,
    pub start_unit: TimeUnit,
    /// Length of the window after `start_at`, 0 = until the end
    pub sample_next: u64,
    pub sample_unit: TimeUnit,
    /// Frames dropped after each kept frame
    pub frame_skip: u64,
}

/// A [`FrameSelection`] resolved against a frame rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameWindow {
    pub start: u64,
    /// Exclusive end, `None` for the rest of the sequence
    pub end: Option<u64>,
    pub step: u64,
}

impl FrameSelection {
    /// Resolve the window; a known `total` clamps the start to the last frame
    pub fn resolve(&self, fps: f64, total: Option<u64>) -> FrameWindow {
        let mut start = self.start_unit.to_frames(self.start_at, fps);
        if let Some(total) = total {
            start = start.min(total.saturating_sub(1));
        }
        let end = match self.sample_next {
            0 => None,
            n => Some(start + self.sample_unit.to_frames(n, fps)),
        };
        FrameWindow {
            start,
            end,
            step: self.frame_skip + 1,
        }
    }
}

impl FrameWindow {
    pub fn keeps(&self, index: u64) -> bool {
        index >= self.start && !self.is_past(index) && (index - self.start) % self.step == 0
    }

    /// True once `index` is beyond the window
    pub fn is_past(&self, index: u64) -> bool {
        self.end.is_some_and(|end| index >= end)
    }

    fn select<T>(&self, frames: Vec<T>) -> Vec<T> {
        frames
            .into_iter()
            .enumerate()
            .filter(|(i, _)| self.keeps(*i as u64))
            .map(|(_, frame)| frame)
            .collect()
    }
}

/// Frames of a media file with the timing before and after selection
#[derive(Debug, Clone)]
pub struct LoadedMedia {
    pub frames: Vec<RgbImage>,
    pub original: MediaInfo,
    pub output: MediaInfo,
}

/// Load the selected frames of an image, animation or video
///
/// A video the pipe cannot read is retried with the image decoders.
pub fn load_visual_media(
    path: &Path,
    selection: &FrameSelection,
    tools: &ToolPaths,
) -> Result<LoadedMedia> {
    if !path.is_file() {
        return Err(NodeError::not_found(path.to_path_buf()));
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

    match MediaType::from_file_name(name) {
        MediaType::Video => load_video(path, selection, tools).or_else(|video_err| {
            info!("Retrying {:?} with the image decoders: {}", path, video_err);
            load_image_frames(path, selection).map_err(|_| video_err)
        }),
        _ => load_image_frames(path, selection),
    }
}

/// Load every media file of a directory into one frame batch
///
/// Files are taken in name order. Frames whose size differs from the first
/// one are scaled and center cropped to it. Unreadable files are skipped.
pub fn load_visual_media_batch(
    dir: &Path,
    recursive: bool,
    selection: &FrameSelection,
    tools: &ToolPaths,
) -> Result<Vec<RgbImage>> {
    if !dir.is_dir() {
        return Err(NodeError::not_found(dir.to_path_buf()));
    }

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .follow_links(true)
        .sort_by_file_name();

    let mut batch: Vec<RgbImage> = Vec::new();
    for entry in walker.into_iter().filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy();
        if !entry.file_type().is_file() || MediaType::from_file_name(&name) == MediaType::Unknown {
            continue;
        }
        let loaded = match load_visual_media(entry.path(), selection, tools) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Skipping {:?} in batch: {}", entry.path(), e);
                continue;
            }
        };

        for frame in loaded.frames {
            let frame = match batch.first() {
                Some(first) if first.dimensions() != frame.dimensions() => {
                    let (w, h) = first.dimensions();
                    DynamicImage::ImageRgb8(frame)
                        .resize_to_fill(w, h, FilterType::Triangle)
                        .into_rgb8()
                }
                _ => frame,
            };
            batch.push(frame);
        }
    }

    Ok(batch)
}

fn load_image_frames(path: &Path, selection: &FrameSelection) -> Result<LoadedMedia> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let ext = extension_of(name).unwrap_or_default();

    let (frames, first_delay_ms) = match ext.as_str() {
        "gif" => decode_animation(GifDecoder::new(open(path)?)?.into_frames().collect_frames()?),
        "webp" => {
            let decoder = WebPDecoder::new(open(path)?)?;
            if decoder.has_animation() {
                decode_animation(decoder.into_frames().collect_frames()?)
            } else {
                (vec![decode_still(path)?], None)
            }
        }
        "png" | "apng" => {
            let mut decoder = PngDecoder::new(open(path)?)?;
            if decoder.is_apng()? {
                decode_animation(decoder.apng()?.into_frames().collect_frames()?)
            } else {
                (vec![decode_still(path)?], None)
            }
        }
        _ => (vec![decode_still(path)?], None),
    };

    let (width, height) = frames
        .first()
        .map(|f| f.dimensions())
        .ok_or_else(|| NodeError::decode(Some(path.to_path_buf()), "No frames decoded"))?;
    let fps = match first_delay_ms {
        Some(ms) if ms > 0.0 => 1000.0 / ms,
        _ => STILL_FPS,
    };

    let total = frames.len() as u64;
    let window = selection.resolve(fps, Some(total));
    let frames = window.select(frames);
    debug!("Kept {} of {} frames from {:?}", frames.len(), total, path);

    Ok(LoadedMedia {
        original: MediaInfo::new(0, total, fps, width, height),
        output: MediaInfo::new(
            window.start,
            frames.len() as u64,
            fps / window.step as f64,
            width,
            height,
        ),
        frames,
    })
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| NodeError::from(e).with_path(path))?;
    Ok(BufReader::new(file))
}

/// RGB frames and the delay of the first one in milliseconds
fn decode_animation(frames: Vec<Frame>) -> (Vec<RgbImage>, Option<f64>) {
    let first_delay_ms = frames.first().map(|f| {
        let (numer, denom) = f.delay().numer_denom_ms();
        numer as f64 / denom.max(1) as f64
    });
    let frames = frames
        .into_iter()
        .map(|f| DynamicImage::ImageRgba8(f.into_buffer()).into_rgb8())
        .collect();
    (frames, first_delay_ms)
}

/// Decode one image with its EXIF orientation applied
fn decode_still(path: &Path) -> Result<RgbImage> {
    let mut decoder = ImageReader::open(path)
        .map_err(|e| NodeError::from(e).with_path(path))?
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image.into_rgb8())
}

fn load_video(path: &Path, selection: &FrameSelection, tools: &ToolPaths) -> Result<LoadedMedia> {
    let probe = video::probe(path, &tools.ffprobe)?;
    let (width, height) = (probe.width, probe.height);
    if width == 0 || height == 0 {
        return Err(NodeError::decode(Some(path.to_path_buf()), "Video has no frame size"));
    }
    let fps = probe.fps.unwrap_or(0.0);
    let total = probe.frame_count.map(|n| n.max(0) as u64);
    let window = selection.resolve(fps, total);

    let mut child = Command::new(&tools.ffmpeg)
        .args(["-v", "error", "-i"])
        .arg(path)
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| NodeError::subprocess(format!("Failed to run {:?}: {}", tools.ffmpeg, e)))?;

    let frame_size = width as usize * height as usize * 3;
    let stdout = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    // stderr drains on its own thread while stdout is read
    let (read, stderr) = std::thread::scope(|scope| {
        let drain = scope.spawn(move || {
            let mut text = String::new();
            if let Some(mut err) = stderr_pipe {
                let _ = err.read_to_string(&mut text);
            }
            text
        });

        let read = read_raw_frames(stdout, frame_size, width, height, &window);
        if !matches!(read, Ok((_, _, false))) {
            let _ = child.kill();
        }
        (read, drain.join().unwrap_or_default())
    });
    let status = child.wait()?;
    let (frames, index, _) = read.map_err(|e| NodeError::from(e).with_path(path))?;

    if frames.is_empty() {
        return Err(NodeError::subprocess(format!(
            "ffmpeg produced no frames for {:?} ({}): {}",
            path,
            status,
            stderr.trim()
        )));
    }

    Ok(LoadedMedia {
        original: MediaInfo::new(0, total.unwrap_or(index), fps, width, height),
        output: MediaInfo::new(
            window.start,
            frames.len() as u64,
            fps / window.step as f64,
            width,
            height,
        ),
        frames,
    })
}

/// Read rgb24 frames from a pipe until EOF or until the window is passed
///
/// Returns the kept frames, the number of frames read and whether reading
/// stopped before EOF.
fn read_raw_frames<R: Read>(
    stdout: Option<R>,
    frame_size: usize,
    width: u32,
    height: u32,
    window: &FrameWindow,
) -> std::io::Result<(Vec<RgbImage>, u64, bool)> {
    let mut stdout = match stdout {
        Some(stdout) => stdout,
        None => return Ok((Vec::new(), 0, false)),
    };
    let mut buffer = vec![0u8; frame_size];
    let mut frames = Vec::new();
    let mut index: u64 = 0;
    loop {
        if window.is_past(index) {
            return Ok((frames, index, true));
        }
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok((frames, index, false)),
            Err(e) => return Err(e),
        }
        if window.keeps(index) {
            if let Some(frame) = RgbImage::from_raw(width, height, buffer.clone()) {
                frames.push(frame);
            }
        }
        index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Rgb, RgbaImage};
    use std::fs;

    fn write_gif(path: &Path, frames: u8) {
        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            for i in 0..frames {
                let buffer = RgbaImage::from_pixel(4, 2, image::Rgba([i * 50, 0, 0, 255]));
                let frame = Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(100, 1));
                encoder.encode_frame(frame).unwrap();
            }
        }
        fs::write(path, out).unwrap();
    }

    fn missing_tools(dir: &Path) -> ToolPaths {
        ToolPaths {
            ffmpeg: dir.join("no-ffmpeg"),
            ffprobe: dir.join("no-ffprobe"),
        }
    }

    #[test]
    fn test_read_raw_frames_stops_past_window() {
        let raw: Vec<u8> = (0..6u8).flat_map(|i| [i; 6]).collect();
        let window = FrameWindow {
            start: 1,
            end: Some(4),
            step: 2,
        };
        let (frames, read, early) =
            read_raw_frames(Some(std::io::Cursor::new(&raw)), 6, 2, 1, &window).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].get_pixel(0, 0), &Rgb([1, 1, 1]));
        assert_eq!(frames[1].get_pixel(1, 0), &Rgb([3, 3, 3]));
        assert_eq!(read, 4);
        assert!(early);

        // a trailing partial frame is dropped at EOF
        let mut tail = raw.clone();
        tail.extend_from_slice(&[9, 9]);
        let open = FrameWindow { start: 0, end: None, step: 1 };
        let (frames, read, early) =
            read_raw_frames(Some(std::io::Cursor::new(&tail)), 6, 2, 1, &open).unwrap();
        assert_eq!((frames.len(), read, early), (6, 6, false));
    }

    #[test]
    fn test_window() {
        let selection = FrameSelection {
            start_at: 2,
            sample_next: 5,
            frame_skip: 1,
            ..Default::default()
        };
        let window = selection.resolve(10.0, Some(100));
        assert_eq!(window, FrameWindow { start: 2, end: Some(7), step: 2 });
        let kept: Vec<u64> = (0..10).filter(|i| window.keeps(*i)).collect();
        assert_eq!(kept, vec![2, 4, 6]);
        assert!(window.is_past(7));

        let seconds = FrameSelection {
            start_at: 1,
            start_unit: TimeUnit::Seconds,
            ..Default::default()
        };
        assert_eq!(seconds.resolve(24.0, None).start, 24);
        assert_eq!(seconds.resolve(24.0, Some(10)).start, 9);
    }

    #[test]
    fn test_load_animated_gif() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anim.gif");
        write_gif(&path, 4);

        let selection = FrameSelection {
            start_at: 1,
            frame_skip: 1,
            ..Default::default()
        };
        let loaded = load_visual_media(&path, &selection, &ToolPaths::default()).unwrap();
        assert_eq!(loaded.frames.len(), 2);
        assert_eq!(loaded.frames[0].get_pixel(0, 0)[0], 50);
        assert_eq!(loaded.original.frame_count, 4);
        assert!((loaded.original.fps - 10.0).abs() < 1e-9);
        assert_eq!(loaded.output.start_frame, 1);
        assert!((loaded.output.fps - 5.0).abs() < 1e-9);
        assert_eq!((loaded.output.width, loaded.output.height), (4, 2));
    }

    #[test]
    fn test_load_still_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("still.png");
        RgbImage::from_pixel(3, 5, Rgb([1, 2, 3])).save(&path).unwrap();

        let loaded =
            load_visual_media(&path, &FrameSelection::default(), &ToolPaths::default()).unwrap();
        assert_eq!(loaded.frames.len(), 1);
        assert_eq!(loaded.original.fps, STILL_FPS);
        assert_eq!(loaded.frames[0].dimensions(), (3, 5));
    }

    #[test]
    fn test_missing_and_undecodable() {
        let dir = tempfile::tempdir().unwrap();
        let tools = missing_tools(dir.path());
        let missing = load_visual_media(&dir.path().join("nope.png"), &FrameSelection::default(), &tools);
        assert_eq!(missing.unwrap_err().kind, crate::error::NodeErrorKind::NotFound);

        let fake = dir.path().join("clip.mp4");
        fs::write(&fake, b"not a video").unwrap();
        assert!(load_visual_media(&fake, &FrameSelection::default(), &tools).is_err());
    }

    #[test]
    fn test_batch_resizes_to_first_frame() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([0, 0, 0])).save(dir.path().join("a.png")).unwrap();
        RgbImage::from_pixel(8, 2, Rgb([9, 9, 9])).save(dir.path().join("b.png")).unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        write_gif(&dir.path().join("sub/c.gif"), 3);
        fs::write(dir.path().join("notes.txt"), b"skip me").unwrap();

        let tools = missing_tools(dir.path());
        let flat = load_visual_media_batch(dir.path(), false, &FrameSelection::default(), &tools)
            .unwrap();
        assert_eq!(flat.len(), 2);
        assert!(flat.iter().all(|f| f.dimensions() == (4, 4)));

        let deep = load_visual_media_batch(dir.path(), true, &FrameSelection::default(), &tools)
            .unwrap();
        assert_eq!(deep.len(), 5);
    }
}
