//! GIF block walking: dimensions, frames, delays and comment extensions

use crate::error::{NodeError, Result};

const EXTENSION_INTRODUCER: u8 = 0x21;
const IMAGE_SEPARATOR: u8 = 0x2C;
const TRAILER: u8 = 0x3B;
const GRAPHIC_CONTROL_LABEL: u8 = 0xF9;
const COMMENT_LABEL: u8 = 0xFE;

/// What a GIF stream says about itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GifInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    /// Delay of the first frame in hundredths of a second
    pub first_delay_cs: Option<u16>,
    pub comments: Vec<String>,
}

impl GifInfo {
    /// Frame rate derived from the first frame delay
    pub fn fps(&self) -> Option<f64> {
        match self.first_delay_cs {
            Some(delay) if delay > 0 && self.frame_count > 1 => Some(100.0 / delay as f64),
            _ => None,
        }
    }
}

/// Walk the blocks of a GIF stream
pub fn read_gif_info(data: &[u8]) -> Result<GifInfo> {
    let start = header_len(data)?;
    let mut info = GifInfo {
        width: u16::from_le_bytes([data[6], data[7]]) as u32,
        height: u16::from_le_bytes([data[8], data[9]]) as u32,
        ..GifInfo::default()
    };

    let mut pos = start;
    while pos < data.len() {
        match data[pos] {
            EXTENSION_INTRODUCER => {
                let label = *data
                    .get(pos + 1)
                    .ok_or_else(|| truncated("extension label"))?;
                let (body, next) = read_sub_blocks(data, pos + 2)?;
                match label {
                    GRAPHIC_CONTROL_LABEL if info.first_delay_cs.is_none() && body.len() >= 3 => {
                        info.first_delay_cs = Some(u16::from_le_bytes([body[1], body[2]]));
                    }
                    COMMENT_LABEL => {
                        info.comments.push(String::from_utf8_lossy(&body).into_owned());
                    }
                    _ => {}
                }
                pos = next;
            }
            IMAGE_SEPARATOR => {
                info.frame_count += 1;
                let packed = *data
                    .get(pos + 9)
                    .ok_or_else(|| truncated("image descriptor"))?;
                let local_table = color_table_len(packed);
                // descriptor, local colour table, LZW minimum code size
                let (_, next) = read_sub_blocks(data, pos + 10 + local_table + 1)?;
                pos = next;
            }
            TRAILER => break,
            other => {
                return Err(NodeError::decode(
                    None,
                    format!("Unexpected GIF block 0x{:02x} at {}", other, pos),
                ))
            }
        }
    }

    Ok(info)
}

/// Replace the comment extensions of a GIF stream with one holding `comment`
///
/// The comment goes right after the global colour table and the stream is
/// marked as GIF89a, the first version with extensions.
pub fn inject_comment(data: &[u8], comment: &str) -> Result<Vec<u8>> {
    let start = header_len(data)?;

    let mut out = Vec::with_capacity(data.len() + comment.len() + 16);
    out.extend_from_slice(b"GIF89a");
    out.extend_from_slice(&data[6..start]);

    out.extend_from_slice(&[EXTENSION_INTRODUCER, COMMENT_LABEL]);
    for block in comment.as_bytes().chunks(255) {
        out.push(block.len() as u8);
        out.extend_from_slice(block);
    }
    out.push(0);

    let mut pos = start;
    while pos < data.len() {
        match data[pos] {
            EXTENSION_INTRODUCER => {
                let label = *data
                    .get(pos + 1)
                    .ok_or_else(|| truncated("extension label"))?;
                let (_, next) = read_sub_blocks(data, pos + 2)?;
                if label != COMMENT_LABEL {
                    out.extend_from_slice(&data[pos..next]);
                }
                pos = next;
            }
            IMAGE_SEPARATOR => {
                let packed = *data
                    .get(pos + 9)
                    .ok_or_else(|| truncated("image descriptor"))?;
                let (_, next) =
                    read_sub_blocks(data, pos + 10 + color_table_len(packed) + 1)?;
                out.extend_from_slice(&data[pos..next]);
                pos = next;
            }
            _ => {
                out.extend_from_slice(&data[pos..]);
                break;
            }
        }
    }

    Ok(out)
}

/// Length of header, logical screen descriptor and global colour table
fn header_len(data: &[u8]) -> Result<usize> {
    if data.len() < 13 || !(data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a")) {
        return Err(NodeError::decode(None, "Not a GIF stream"));
    }
    let len = 13 + color_table_len(data[10]);
    if len > data.len() {
        return Err(truncated("global colour table"));
    }
    Ok(len)
}

fn color_table_len(packed: u8) -> usize {
    if packed & 0x80 != 0 {
        3 * (1 << ((packed & 0x07) + 1))
    } else {
        0
    }
}

/// Concatenate the data sub-blocks starting at `pos`
///
/// Returns the data and the position after the block terminator.
fn read_sub_blocks(data: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut body = Vec::new();
    loop {
        let size = *data.get(pos).ok_or_else(|| truncated("sub-block"))? as usize;
        pos += 1;
        if size == 0 {
            return Ok((body, pos));
        }
        let end = pos + size;
        if end > data.len() {
            return Err(truncated("sub-block data"));
        }
        body.extend_from_slice(&data[pos..end]);
        pos = end;
    }
}

fn truncated(what: &str) -> NodeError {
    NodeError::decode(None, format!("Truncated GIF {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::{GifEncoder, Repeat};
    use image::{Delay, Frame, RgbaImage};

    fn sample_gif(frames: u32) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            encoder.set_repeat(Repeat::Infinite).unwrap();
            for i in 0..frames {
                let buffer = RgbaImage::from_pixel(6, 4, image::Rgba([i as u8 * 40, 0, 0, 255]));
                let frame = Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(100, 1));
                encoder.encode_frame(frame).unwrap();
            }
        }
        out
    }

    #[test]
    fn test_reads_frames_and_delay() {
        let info = read_gif_info(&sample_gif(3)).unwrap();
        assert_eq!((info.width, info.height), (6, 4));
        assert_eq!(info.frame_count, 3);
        assert_eq!(info.first_delay_cs, Some(10));
        assert_eq!(info.fps(), Some(10.0));
        assert!(info.comments.is_empty());
    }

    #[test]
    fn test_comment_injection_replaces_previous() {
        let long = "x".repeat(600);
        let once = inject_comment(&sample_gif(2), "old").unwrap();
        let twice = inject_comment(&once, &long).unwrap();

        let info = read_gif_info(&twice).unwrap();
        assert_eq!(info.comments, vec![long]);
        assert_eq!(info.frame_count, 2);

        let decoded = image::load_from_memory(&twice).unwrap();
        assert_eq!(decoded.width(), 6);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(read_gif_info(b"not a gif at all").is_err());
        assert!(inject_comment(b"GIF89a", "c").is_err());
    }
}
