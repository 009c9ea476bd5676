//! PNG / APNG: dimensions, frame timing and text chunks

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::{NodeError, Result};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Header information and text of a PNG file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PngInfo {
    pub width: u32,
    pub height: u32,
    /// Frame count from `acTL`, 1 for still images
    pub frame_count: u32,
    /// Frame rate from the first `fcTL`, when animated
    pub fps: Option<f64>,
    /// Keyword / text pairs from `tEXt`, `zTXt` and `iTXt`
    pub texts: Vec<(String, String)>,
}

/// Read a PNG header and the text chunks that precede the image data
pub fn read_png_info(path: &Path) -> Result<PngInfo> {
    let file = File::open(path).map_err(|e| NodeError::from(e).with_path(path))?;
    let decoder = png::Decoder::new(BufReader::new(file));
    let reader = decoder
        .read_info()
        .map_err(|e| NodeError::from(e).with_path(path))?;
    let info = reader.info();

    let mut texts: Vec<(String, String)> = info
        .uncompressed_latin1_text
        .iter()
        .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
        .collect();
    for chunk in &info.compressed_latin1_text {
        if let Ok(text) = chunk.get_text() {
            texts.push((chunk.keyword.clone(), text));
        }
    }
    for chunk in &info.utf8_text {
        if let Ok(text) = chunk.get_text() {
            texts.push((chunk.keyword.clone(), text));
        }
    }

    let frame_count = info.animation_control.map(|a| a.num_frames).unwrap_or(1);
    let fps = info.frame_control.and_then(|fc| {
        if frame_count <= 1 || fc.delay_num == 0 {
            return None;
        }
        // A zero denominator means hundredths of a second
        let den = if fc.delay_den == 0 { 100 } else { fc.delay_den };
        Some(den as f64 / fc.delay_num as f64)
    });

    Ok(PngInfo {
        width: info.width,
        height: info.height,
        frame_count,
        fps,
        texts,
    })
}

/// Encode an RGB frame as PNG
pub fn encode_rgb(frame: &image::RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut buffer, frame.width(), frame.height());
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(frame.as_raw())?;
        writer.finish()?;
    }
    Ok(buffer)
}

/// Insert text chunks into an encoded PNG
///
/// Existing text chunks with the same keyword are dropped. New chunks go
/// right before the first `fcTL` or `IDAT`, so readers that stop at the
/// image data still see them.
pub fn inject_text_chunks(data: &[u8], entries: &[(String, String)]) -> Result<Vec<u8>> {
    if data.len() < PNG_SIGNATURE.len() || data[..8] != PNG_SIGNATURE {
        return Err(NodeError::decode(None, "Not a PNG stream"));
    }

    let mut out = Vec::with_capacity(data.len() + entries.len() * 64);
    out.extend_from_slice(&PNG_SIGNATURE);

    let mut inserted = false;
    let mut pos = 8;
    while pos + 12 <= data.len() {
        let length = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let end = pos + 12 + length;
        if end > data.len() {
            return Err(NodeError::decode(None, "Truncated PNG chunk"));
        }
        let chunk_type = &data[pos + 4..pos + 8];
        let body = &data[pos + 8..pos + 8 + length];

        if !inserted && (chunk_type == b"IDAT" || chunk_type == b"fcTL") {
            for (keyword, text) in entries {
                write_text_chunk(&mut out, keyword, text)?;
            }
            inserted = true;
        }

        let replaced = matches!(chunk_type, b"tEXt" | b"zTXt" | b"iTXt")
            && entries
                .iter()
                .any(|(keyword, _)| chunk_keyword(body) == keyword.as_bytes());
        if !replaced {
            out.extend_from_slice(&data[pos..end]);
        }

        pos = end;
    }

    if !inserted {
        return Err(NodeError::decode(None, "PNG stream has no image data"));
    }
    Ok(out)
}

fn chunk_keyword(body: &[u8]) -> &[u8] {
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    &body[..end]
}

fn write_text_chunk(out: &mut Vec<u8>, keyword: &str, text: &str) -> Result<()> {
    if keyword.is_empty() || keyword.len() > 79 {
        return Err(NodeError::invalid_input(format!(
            "PNG text keyword must be 1-79 bytes: {:?}",
            keyword
        )));
    }

    let mut body = Vec::with_capacity(keyword.len() + text.len() + 5);
    body.extend_from_slice(keyword.as_bytes());
    body.push(0);
    if text.is_ascii() {
        body.extend_from_slice(text.as_bytes());
        write_chunk(out, b"tEXt", &body);
    } else {
        // compression flag, compression method, empty language, empty translated keyword
        body.extend_from_slice(&[0, 0, 0, 0]);
        body.extend_from_slice(text.as_bytes());
        write_chunk(out, b"iTXt", &body);
    }
    Ok(())
}

fn write_chunk(out: &mut Vec<u8>, chunk_type: &[u8; 4], body: &[u8]) {
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(body);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(chunk_type);
    hasher.update(body);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
}
