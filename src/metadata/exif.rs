//! EXIF `UserComment` reading and writing for JPEG and WebP

use log::debug;
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;

use crate::error::{NodeError, Result};

const TAG_EXIF_IFD_POINTER: u16 = 0x8769;
const TAG_USER_COMMENT: u16 = 0x9286;
const TYPE_LONG: u16 = 4;
const TYPE_UNDEFINED: u16 = 7;
const UNICODE_PREFIX: &[u8; 8] = b"UNICODE\0";
const ASCII_PREFIX: &[u8; 8] = b"ASCII\0\0\0";
const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";

// VP8X flag bits
const VP8X_EXIF: u8 = 0x08;
const VP8X_ALPHA: u8 = 0x10;

/// Read the decoded `UserComment` of a JPEG or WebP file
///
/// Returns `Ok(None)` when the file carries no EXIF block or no comment.
pub fn read_user_comment(path: &Path) -> Result<Option<String>> {
    let file = File::open(path).map_err(|e| NodeError::from(e).with_path(path))?;
    let mut reader = BufReader::new(file);
    let exif = match ::exif::Reader::new().read_from_container(&mut reader) {
        Ok(exif) => exif,
        Err(::exif::Error::NotFound(_)) => return Ok(None),
        Err(e) => {
            return Err(NodeError::decode(
                Some(path.to_path_buf()),
                format!("Unreadable EXIF: {}", e),
            ))
        }
    };

    let field = match exif.get_field(::exif::Tag::UserComment, ::exif::In::PRIMARY) {
        Some(field) => field,
        None => return Ok(None),
    };

    match &field.value {
        ::exif::Value::Undefined(bytes, _) => Ok(decode_user_comment(bytes)),
        other => {
            debug!("UserComment of {:?} has unexpected type {:?}", path, other);
            Ok(None)
        }
    }
}

/// Decode the raw bytes of a `UserComment` field
///
/// The first eight bytes name the character code. `UNICODE` payloads are
/// UTF-16 in either byte order; the order is guessed from where the zero
/// bytes of ASCII-range characters fall.
pub fn decode_user_comment(bytes: &[u8]) -> Option<String> {
    let text = if bytes.len() >= 8 && &bytes[..8] == UNICODE_PREFIX {
        decode_utf16_guess(&bytes[8..])
    } else if bytes.len() >= 8 && (&bytes[..8] == ASCII_PREFIX || bytes[..8] == [0u8; 8]) {
        String::from_utf8_lossy(&bytes[8..]).into_owned()
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    };

    let text = text.replace('\0', "");
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn decode_utf16_guess(body: &[u8]) -> String {
    let even_zeros = body.iter().step_by(2).filter(|b| **b == 0).count();
    let odd_zeros = body.iter().skip(1).step_by(2).filter(|b| **b == 0).count();
    let big_endian = even_zeros >= odd_zeros;

    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// Build a big-endian TIFF block holding only a `UserComment`
pub fn build_user_comment_tiff(comment: &str) -> Vec<u8> {
    let mut value = UNICODE_PREFIX.to_vec();
    for unit in comment.encode_utf16() {
        value.extend_from_slice(&unit.to_be_bytes());
    }

    // header (8) + IFD0 (2 + 12 + 4) puts the Exif IFD at 26,
    // and the Exif IFD (2 + 12 + 4) puts the value at 44
    let exif_ifd_offset: u32 = 26;
    let value_offset: u32 = 44;

    let mut tiff = Vec::with_capacity(44 + value.len());
    tiff.extend_from_slice(b"MM");
    tiff.extend_from_slice(&42u16.to_be_bytes());
    tiff.extend_from_slice(&8u32.to_be_bytes());

    write_ifd(&mut tiff, TAG_EXIF_IFD_POINTER, TYPE_LONG, 1, exif_ifd_offset);
    write_ifd(
        &mut tiff,
        TAG_USER_COMMENT,
        TYPE_UNDEFINED,
        value.len() as u32,
        value_offset,
    );
    tiff.extend_from_slice(&value);
    tiff
}

fn write_ifd(out: &mut Vec<u8>, tag: u16, field_type: u16, count: u32, value: u32) {
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend_from_slice(&field_type.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    out.extend_from_slice(&value.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes());
}

/// Put a `UserComment` into a JPEG stream as an APP1 segment after SOI
///
/// Leading APP1 Exif segments are replaced.
pub fn inject_into_jpeg(data: &[u8], comment: &str) -> Result<Vec<u8>> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return Err(NodeError::decode(None, "Not a JPEG stream"));
    }

    let tiff = build_user_comment_tiff(comment);
    let segment_len = 2 + EXIF_HEADER.len() + tiff.len();
    if segment_len > u16::MAX as usize {
        return Err(NodeError::invalid_input(
            "Metadata is too large for a JPEG APP1 segment",
        ));
    }

    let mut out = Vec::with_capacity(data.len() + segment_len + 2);
    out.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE1]);
    out.extend_from_slice(&(segment_len as u16).to_be_bytes());
    out.extend_from_slice(EXIF_HEADER);
    out.extend_from_slice(&tiff);

    let mut pos = 2;
    while pos + 4 <= data.len() && data[pos] == 0xFF && (0xE0..=0xEF).contains(&data[pos + 1]) {
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let end = pos + 2 + len;
        if end > data.len() {
            return Err(NodeError::decode(None, "Truncated JPEG segment"));
        }
        let is_exif = data[pos + 1] == 0xE1 && data[pos + 4..end].starts_with(EXIF_HEADER);
        if !is_exif {
            out.extend_from_slice(&data[pos..end]);
        }
        pos = end;
    }
    out.extend_from_slice(&data[pos..]);
    Ok(out)
}

/// Put a `UserComment` into a WebP stream as an `EXIF` chunk
///
/// Simple-format files are promoted to the extended format so the `VP8X`
/// header can announce the chunk.
pub fn inject_into_webp(data: &[u8], comment: &str) -> Result<Vec<u8>> {
    if data.len() < 12 || &data[..4] != b"RIFF" || &data[8..12] != b"WEBP" {
        return Err(NodeError::decode(None, "Not a WebP stream"));
    }

    let mut chunks: Vec<([u8; 4], Vec<u8>)> = Vec::new();
    let mut pos = 12;
    while pos + 8 <= data.len() {
        let mut fourcc = [0u8; 4];
        fourcc.copy_from_slice(&data[pos..pos + 4]);
        let size = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
            as usize;
        let start = pos + 8;
        let end = start + size;
        if end > data.len() {
            return Err(NodeError::decode(None, "Truncated WebP chunk"));
        }
        if &fourcc != b"EXIF" {
            chunks.push((fourcc, data[start..end].to_vec()));
        }
        pos = end + (size & 1);
    }

    let first = chunks.first().map(|(fourcc, body)| (*fourcc, body.len()));
    match first {
        Some((fourcc, len)) if &fourcc == b"VP8X" && len > 0 => {
            chunks[0].1[0] |= VP8X_EXIF;
        }
        Some((fourcc, _)) if &fourcc == b"VP8 " || &fourcc == b"VP8L" => {
            let lossless = &fourcc == b"VP8L";
            let (width, height) = image::ImageReader::with_format(
                Cursor::new(data),
                image::ImageFormat::WebP,
            )
            .into_dimensions()?;
            let mut vp8x = vec![VP8X_EXIF | if lossless { VP8X_ALPHA } else { 0 }, 0, 0, 0];
            vp8x.extend_from_slice(&(width - 1).to_le_bytes()[..3]);
            vp8x.extend_from_slice(&(height - 1).to_le_bytes()[..3]);
            chunks.insert(0, (*b"VP8X", vp8x));
        }
        _ => return Err(NodeError::decode(None, "WebP stream has no image chunk")),
    }

    let mut exif_body = EXIF_HEADER.to_vec();
    exif_body.extend_from_slice(&build_user_comment_tiff(comment));
    chunks.push((*b"EXIF", exif_body));

    let mut body = b"WEBP".to_vec();
    for (fourcc, chunk) in &chunks {
        body.extend_from_slice(fourcc);
        body.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        body.extend_from_slice(chunk);
        if chunk.len() % 2 == 1 {
            body.push(0);
        }
    }

    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
