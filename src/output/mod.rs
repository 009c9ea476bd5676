//! Saving frame sequences as animated images or ffmpeg-encoded videos

pub mod formats;

use image::codecs::gif::{GifEncoder, Repeat};
use image::codecs::webp::WebPEncoder;
use image::{Delay, DynamicImage, ExtendedColorType, Frame, ImageEncoder, RgbImage};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::ToolPaths;
use crate::error::{NodeError, Result};
use crate::folders::{is_contained, to_slash, FolderPaths};
use crate::media::path_extension;
use crate::metadata;

pub use formats::{VideoFormat, VideoFormats};

/// Image formats written without ffmpeg
pub const IMAGE_OUTPUT_FORMATS: &[&str] = &["gif", "webp", "png", "apng"];

/// Suffix used when none is given
pub const DEFAULT_FILENAME_SUFFIX: &str = "Video";

/// Audio inputs accepted for muxing
pub const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3"];

/// Options of a save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveVideoOptions {
    pub frame_rate: f64,
    /// Number of loops for animated images, 0 loops forever
    pub loop_count: u16,
    /// Appended to the counter; may contain a subfolder
    pub filename_suffix: String,
    /// `image/<ext>` or `video/<preset>`
    pub format: String,
    /// Save under `output` instead of `temp`
    pub save_to_output_dir: bool,
    /// 0 to 100
    pub quality: u8,
    pub save_metadata: bool,
    /// Keep the `prompt` and `workflow` entries
    pub save_workflow: bool,
    /// `.wav` or `.mp3` muxed into a copy of a video output
    pub audio_file: Option<PathBuf>,
}

impl Default for SaveVideoOptions {
    fn default() -> Self {
        Self {
            frame_rate: 8.0,
            loop_count: 0,
            filename_suffix: String::new(),
            format: "image/webp".to_string(),
            save_to_output_dir: true,
            quality: 95,
            save_metadata: true,
            save_workflow: true,
            audio_file: None,
        }
    }
}

/// Where a saved file can be fetched from through `/view`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPreview {
    pub filename: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub format: String,
}

/// Output format split into its kind and name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Image(String),
    Video(String),
}

impl OutputFormat {
    pub fn parse(format: &str) -> Result<Self> {
        match format.split_once('/') {
            Some(("image", ext)) if IMAGE_OUTPUT_FORMATS.contains(&ext) => {
                Ok(OutputFormat::Image(ext.to_string()))
            }
            Some(("video", name)) if !name.is_empty() => Ok(OutputFormat::Video(name.to_string())),
            _ => Err(NodeError::invalid_input(format!(
                "Unsupported output format: {}",
                format
            ))),
        }
    }
}

const VP8X_ANIMATION: u8 = 0x02;
const ANMF_NO_BLEND: u8 = 0x02;

/// Encoders a save may need
#[derive(Debug, Clone, Copy)]
pub struct Encoders<'a> {
    pub formats: &'a VideoFormats,
    pub tools: &'a ToolPaths,
}

/// Save frames as one counter-named file and describe it for previews
///
/// Files are named `{counter:05}_{suffix}.{ext}` where the counter starts at
/// the number of entries in the target folder plus one and skips names that
/// are already taken.
pub fn save_video(
    frames: &[RgbImage],
    options: &SaveVideoOptions,
    metadata: &Map<String, Value>,
    folders: &FolderPaths,
    encoders: Encoders<'_>,
) -> Result<SavedPreview> {
    let first = frames
        .first()
        .ok_or_else(|| NodeError::invalid_input("No frames to save"))?;
    if frames.iter().any(|f| f.dimensions() != first.dimensions()) {
        return Err(NodeError::invalid_input("Frames differ in size"));
    }
    if options.frame_rate <= 0.0 {
        return Err(NodeError::invalid_input("Frame rate must be positive"));
    }
    let format = OutputFormat::parse(&options.format)?;

    let (kind, base) = if options.save_to_output_dir {
        ("output", folders.output_dir())
    } else {
        ("temp", folders.temp_dir())
    };
    let (subfolder, suffix) = split_suffix(&options.filename_suffix)?;
    let folder = base.join(&subfolder);
    fs::create_dir_all(&folder).map_err(|e| NodeError::from(e).with_path(&folder))?;

    let kept = filter_metadata(metadata, options);
    let kept = if options.save_metadata { Some(&kept) } else { None };

    let path = match &format {
        OutputFormat::Image(ext) => {
            let path = next_free_path(&folder, &suffix, ext)?;
            let data = encode_image(frames, ext, options)?;
            let data = match kept {
                Some(map) if !map.is_empty() => metadata::embed(&data, ext, map)?,
                _ => data,
            };
            fs::write(&path, data).map_err(|e| NodeError::from(e).with_path(&path))?;
            path
        }
        OutputFormat::Video(name) => {
            let preset = encoders.formats.get(name).ok_or_else(|| {
                NodeError::invalid_input(format!("Unknown video format: {}", name))
            })?;
            let path = next_free_path(&folder, &suffix, &preset.extension)?;
            encode_video(frames, &path, preset, options, kept, folders, encoders.tools)?;
            if let Some(audio) = &options.audio_file {
                mux_audio(&path, audio, preset, encoders.tools);
            }
            path
        }
    };

    info!("Saved {:?}", path);
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(SavedPreview {
        filename,
        subfolder: to_slash(&subfolder),
        kind: kind.to_string(),
        format: options.format.clone(),
    })
}

/// Split `sub/dir/name` into its folder and file name part
fn split_suffix(suffix: &str) -> Result<(PathBuf, String)> {
    let suffix = suffix.trim().replace('\\', "/");
    let suffix = if suffix.is_empty() {
        DEFAULT_FILENAME_SUFFIX.to_string()
    } else {
        suffix
    };
    let (subfolder, name) = match suffix.rsplit_once('/') {
        Some((dir, name)) => (PathBuf::from(dir), name.to_string()),
        None => (PathBuf::new(), suffix.clone()),
    };
    if !is_contained(&subfolder) {
        return Err(NodeError::invalid_path(
            subfolder,
            "Output subfolder escapes the output directory",
        ));
    }
    let name = if name.is_empty() {
        DEFAULT_FILENAME_SUFFIX.to_string()
    } else {
        name
    };
    Ok((subfolder, name))
}

fn next_free_path(folder: &Path, suffix: &str, ext: &str) -> Result<PathBuf> {
    let mut counter = fs::read_dir(folder)
        .map_err(|e| NodeError::from(e).with_path(folder))?
        .count()
        + 1;
    loop {
        let path = folder.join(format!("{:05}_{}.{}", counter, suffix, ext));
        if !path.exists() {
            return Ok(path);
        }
        counter += 1;
    }
}

/// Metadata to write, without the workflow entries when they are not kept
fn filter_metadata(metadata: &Map<String, Value>, options: &SaveVideoOptions) -> Map<String, Value> {
    metadata
        .iter()
        .filter(|(key, _)| {
            options.save_workflow || !matches!(key.as_str(), "prompt" | "workflow")
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn frame_delay_ms(frame_rate: f64) -> u32 {
    (1000.0 / frame_rate).round().max(1.0) as u32
}

fn encode_image(frames: &[RgbImage], ext: &str, options: &SaveVideoOptions) -> Result<Vec<u8>> {
    let delay_ms = frame_delay_ms(options.frame_rate);
    let mut out = Vec::new();
    match ext {
        "gif" => {
            let mut encoder = GifEncoder::new(&mut out);
            let repeat = match options.loop_count {
                0 => Repeat::Infinite,
                n => Repeat::Finite(n),
            };
            encoder.set_repeat(repeat)?;
            let delay = Delay::from_numer_denom_ms(delay_ms, 1);
            encoder.encode_frames(frames.iter().map(|f| {
                let rgba = DynamicImage::ImageRgb8(f.clone()).to_rgba8();
                Frame::from_parts(rgba, 0, 0, delay)
            }))?;
        }
        "webp" => out = encode_webp(frames, delay_ms, options)?,
        "png" => out = metadata::png::encode_rgb(&frames[0])?,
        "apng" => out = encode_apng(frames, delay_ms, options)?,
        other => {
            return Err(NodeError::invalid_input(format!(
                "Unsupported image format: {}",
                other
            )))
        }
    }
    Ok(out)
}

/// Animated WebP: one lossless `VP8L` bitstream per `ANMF` frame
fn encode_webp(frames: &[RgbImage], delay_ms: u32, options: &SaveVideoOptions) -> Result<Vec<u8>> {
    let (width, height) = frames[0].dimensions();
    let mut body = b"WEBP".to_vec();

    let mut vp8x = vec![VP8X_ANIMATION, 0, 0, 0];
    vp8x.extend_from_slice(&canvas_size(width, height));
    push_riff_chunk(&mut body, b"VP8X", &vp8x);

    // background colour, then loop count (0 = forever)
    let mut anim = vec![0u8; 4];
    anim.extend_from_slice(&options.loop_count.to_le_bytes());
    push_riff_chunk(&mut body, b"ANIM", &anim);

    let duration = delay_ms.min(0xFF_FFFF).to_le_bytes();
    for frame in frames {
        let mut still = Vec::new();
        WebPEncoder::new_lossless(&mut still).write_image(
            frame.as_raw(),
            width,
            height,
            ExtendedColorType::Rgb8,
        )?;
        let bitstream = vp8l_payload(&still)?;

        // offset (0, 0), frame size, duration, no blending
        let mut anmf = vec![0u8; 6];
        anmf.extend_from_slice(&canvas_size(width, height));
        anmf.extend_from_slice(&duration[..3]);
        anmf.push(ANMF_NO_BLEND);
        push_riff_chunk(&mut anmf, b"VP8L", bitstream);
        push_riff_chunk(&mut body, b"ANMF", &anmf);
    }

    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    debug!("Encoded {} WebP frame(s), {} bytes", frames.len(), out.len());
    Ok(out)
}

/// Width and height minus one, 24 bits each
fn canvas_size(width: u32, height: u32) -> [u8; 6] {
    let w = (width - 1).to_le_bytes();
    let h = (height - 1).to_le_bytes();
    [w[0], w[1], w[2], h[0], h[1], h[2]]
}

fn push_riff_chunk(out: &mut Vec<u8>, fourcc: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
}

/// The `VP8L` bitstream of a simple-format lossless WebP
fn vp8l_payload(still: &[u8]) -> Result<&[u8]> {
    if still.len() < 20 || &still[12..16] != b"VP8L" {
        return Err(NodeError::decode(None, "Encoder did not produce a lossless WebP frame"));
    }
    let size = u32::from_le_bytes([still[16], still[17], still[18], still[19]]) as usize;
    still
        .get(20..20 + size)
        .ok_or_else(|| NodeError::decode(None, "Truncated WebP frame"))
}

fn encode_apng(frames: &[RgbImage], delay_ms: u32, options: &SaveVideoOptions) -> Result<Vec<u8>> {
    let (width, height) = frames[0].dimensions();
    let mut buffer = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buffer, width, height);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_compression(match options.quality / 11 {
            0..=3 => png::Compression::Fast,
            4..=6 => png::Compression::Default,
            _ => png::Compression::Best,
        });
        encoder.set_animated(frames.len() as u32, options.loop_count as u32)?;
        encoder.set_frame_delay(delay_ms.min(u16::MAX as u32) as u16, 1000)?;
        let mut writer = encoder.write_header()?;
        for frame in frames {
            writer.write_image_data(frame.as_raw())?;
        }
        writer.finish()?;
    }
    Ok(buffer)
}

/// Escape text for an `;FFMETADATA1` value
pub fn escape_ffmetadata(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | ';' | '#' | '=' | '\n' => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

/// ffmpeg constant rate factor for a 0 to 100 quality
pub fn quality_to_crf(quality: u8) -> u8 {
    let quality = quality.min(100) as u32;
    ((100 - quality) * 51 / 100) as u8
}

fn encode_video(
    frames: &[RgbImage],
    path: &Path,
    preset: &VideoFormat,
    options: &SaveVideoOptions,
    metadata: Option<&Map<String, Value>>,
    folders: &FolderPaths,
    tools: &ToolPaths,
) -> Result<()> {
    let (width, height) = frames[0].dimensions();
    let mut args: Vec<OsString> = [
        "-v".to_string(),
        "error".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-s".to_string(),
        format!("{}x{}", width, height),
        "-r".to_string(),
        options.frame_rate.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-crf".to_string(),
        quality_to_crf(options.quality).to_string(),
    ]
    .into_iter()
    .map(OsString::from)
    .chain(preset.main_pass.iter().map(OsString::from))
    .collect();
    args.push(path.as_os_str().to_owned());

    if let Some(map) = metadata.filter(|m| !m.is_empty()) {
        let temp = folders.temp_dir();
        fs::create_dir_all(&temp).map_err(|e| NodeError::from(e).with_path(&temp))?;
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata_path = temp.join(format!("{}.ffmetadata.txt", stem));
        let body = format!(
            ";FFMETADATA1\ncomment={}",
            escape_ffmetadata(&metadata::sorted_json(map, false)?)
        );
        fs::write(&metadata_path, body).map_err(|e| NodeError::from(e).with_path(&metadata_path))?;

        let mut with_metadata: Vec<OsString> =
            vec![OsString::from("-i"), metadata_path.as_os_str().to_owned()];
        with_metadata.extend(args.iter().cloned());
        let result = run_encoder(&tools.ffmpeg, &with_metadata, preset, frames);
        if let Err(e) = fs::remove_file(&metadata_path) {
            debug!("Could not remove {:?}: {}", metadata_path, e);
        }
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("Saving {:?} with metadata failed, retrying without: {}", path, e);
                if let Err(e) = fs::remove_file(path) {
                    debug!("No partial output to remove at {:?}: {}", path, e);
                }
            }
        }
    }

    run_encoder(&tools.ffmpeg, &args, preset, frames).map_err(|e| e.with_path(path))
}

/// Pipe raw RGB frames into ffmpeg
fn run_encoder(
    ffmpeg: &Path,
    args: &[OsString],
    preset: &VideoFormat,
    frames: &[RgbImage],
) -> Result<()> {
    let mut child = Command::new(ffmpeg)
        .args(args)
        .envs(&preset.environment)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| NodeError::subprocess(format!("Failed to run {:?}: {}", ffmpeg, e)))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| NodeError::subprocess("ffmpeg stdin is not available"))?;

    let (written, output) = std::thread::scope(|scope| {
        let writer = scope.spawn(move || -> std::io::Result<()> {
            for frame in frames {
                stdin.write_all(frame.as_raw())?;
            }
            Ok(())
        });
        let output = child.wait_with_output();
        (writer.join(), output)
    });

    let output = output?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(NodeError::subprocess(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    if !stderr.trim().is_empty() {
        warn!("ffmpeg: {}", stderr.trim());
    }
    match written {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(NodeError::subprocess("Frame writer panicked")),
    }
}

/// Output container and audio codec for a video extension
pub fn audio_settings(video_ext: &str) -> Option<(&'static str, &'static str)> {
    match video_ext {
        "mov" => Some(("mov", "pcm_s16le")),
        "mp4" => Some(("mp4", "aac")),
        "mkv" => Some(("mkv", "aac")),
        "webm" | "av1" => Some(("webm", "libvorbis")),
        _ => None,
    }
}

/// Path of the muxed copy, `<stem>-audio.<ext>`
pub fn audio_output_path(video: &Path, ext: &str) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    video.with_file_name(format!("{}-audio.{}", stem, ext))
}

/// Write a copy of the video with the audio track added
///
/// Unsupported inputs and ffmpeg failures are logged and leave only the
/// silent video.
fn mux_audio(video: &Path, audio: &Path, preset: &VideoFormat, tools: &ToolPaths) {
    if !audio.is_file() || !AUDIO_EXTENSIONS.contains(&path_extension(audio).as_str()) {
        warn!("Skipping audio {:?}: not a .wav or .mp3 file", audio);
        return;
    }
    let (ext, codec) = match audio_settings(&path_extension(video)) {
        Some(settings) => settings,
        None => {
            warn!("No audio settings for {:?}", video);
            return;
        }
    };
    let out = audio_output_path(video, ext);

    let status = Command::new(&tools.ffmpeg)
        .arg("-y")
        .arg("-i")
        .arg(video)
        .arg("-i")
        .arg(audio)
        .args(["-c:v", "copy", "-c:a", codec, "-b:a", "192k", "-strict", "experimental", "-shortest"])
        .arg(&out)
        .envs(&preset.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => info!("Saved {:?}", out),
        Ok(status) => warn!("Muxing audio into {:?} exited with {}", out, status),
        Err(e) => warn!("Failed to run {:?}: {}", tools.ffmpeg, e),
    }
}
