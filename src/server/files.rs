//! File access behind the backend routes: validation, previews, uploads

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{NodeError, Result};
use crate::familiar::split_extension;
use crate::folders::{is_contained, FolderPaths};
use crate::media::path_extension;

/// Model type used when a request names none
pub const DEFAULT_FILE_TYPE: &str = "loras";

/// Directory type used when an upload names none
pub const DEFAULT_UPLOAD_TYPE: &str = "input";

/// Quality of lossy previews when the request names none
pub const DEFAULT_PREVIEW_QUALITY: u8 = 90;

/// `type`, `subfolder` and `filename` of a file request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub subfolder: Option<String>,
    pub filename: Option<String>,
}

/// A requested file that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedFile {
    pub base_dir: PathBuf,
    pub subfolder: String,
    pub filename: String,
    pub file: PathBuf,
}

/// Resolve a file request below the base directory of its type
///
/// Filenames starting with `/`, `..` or `./` are rejected, as are
/// subfolders and filenames that leave the base directory, including
/// through a symlink.
pub fn validate_requested_file(folders: &FolderPaths, query: &FileQuery) -> Result<RequestedFile> {
    let kind = query.kind.as_deref().unwrap_or(DEFAULT_FILE_TYPE);
    let root = folders.base_dir(kind).ok_or_else(|| {
        NodeError::invalid_input(format!("Unable to get parent directory for {}", kind))
    })?;
    let mut base_dir = root.clone();

    let subfolder = query.subfolder.clone().unwrap_or_default();
    if !subfolder.is_empty() {
        if !is_contained(Path::new(&subfolder)) {
            return Err(NodeError::invalid_path(&subfolder, "Subfolder escapes the base directory"));
        }
        base_dir = base_dir.join(&subfolder);
    }

    let filename = query
        .filename
        .clone()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| NodeError::invalid_input("Missing filename"))?;
    if filename.starts_with('/') || filename.starts_with("..") || filename.starts_with("./") {
        return Err(NodeError::invalid_path(
            &filename,
            "Attempting to access an arbitrary path",
        ));
    }
    if !is_contained(Path::new(&filename)) {
        return Err(NodeError::invalid_path(&filename, "Filename escapes the base directory"));
    }

    let file = base_dir.join(&filename);
    if !file.is_file() {
        return Err(NodeError::not_found(file));
    }
    if !fs::canonicalize(&file)?.starts_with(fs::canonicalize(&root)?) {
        return Err(NodeError::invalid_path(&filename, "File resolves outside the base directory"));
    }
    Ok(RequestedFile {
        base_dir,
        subfolder,
        filename,
        file,
    })
}

/// Encoded image body with its MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedImage {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// Re-encode an image for a `preview=<format>;<quality>` request
///
/// Only `webp`, `jpeg` and `jpg` are honoured, anything else becomes WebP,
/// as does any request for the alpha channel. JPEG and `channel=rgb` drop
/// the alpha channel. WebP is encoded losslessly.
pub fn render_preview(path: &Path, preview: &str, channel: Option<&str>) -> Result<RenderedImage> {
    let mut parts = preview.split(';');
    let requested = parts.next().unwrap_or_default().to_lowercase();
    let quality = preview
        .rsplit(';')
        .next()
        .and_then(|q| q.parse::<u8>().ok())
        .unwrap_or(DEFAULT_PREVIEW_QUALITY)
        .clamp(1, 100);

    let wants_alpha = channel.is_some_and(|c| c.contains('a'));
    let is_jpeg = matches!(requested.as_str(), "jpeg" | "jpg") && !wants_alpha;

    let img = open_image(path)?;
    let mut body = Cursor::new(Vec::new());
    let content_type = if is_jpeg {
        let rgb = img.to_rgb8();
        JpegEncoder::new_with_quality(&mut body, quality).encode_image(&rgb)?;
        "image/jpeg"
    } else {
        let img = if channel == Some("rgb") || !img.color().has_alpha() {
            DynamicImage::ImageRgb8(img.to_rgb8())
        } else {
            DynamicImage::ImageRgba8(img.to_rgba8())
        };
        img.write_to(&mut body, ImageFormat::WebP)?;
        "image/webp"
    };
    Ok(RenderedImage {
        body: body.into_inner(),
        content_type: content_type.to_string(),
    })
}

/// Extract one channel set of an image as PNG
///
/// `rgb` drops alpha. `a` yields a black image carrying the source alpha,
/// fully opaque when the source has none. `None` for any other channel.
pub fn render_channel(path: &Path, channel: &str) -> Result<Option<RenderedImage>> {
    let img = match channel {
        "rgb" => DynamicImage::ImageRgb8(open_image(path)?.to_rgb8()),
        "a" => {
            let source = open_image(path)?;
            let (width, height) = source.dimensions();
            let has_alpha = source.color().has_alpha();
            let rgba = source.to_rgba8();
            let alpha = RgbaImage::from_fn(width, height, |x, y| {
                let a = if has_alpha { rgba.get_pixel(x, y)[3] } else { 255 };
                image::Rgba([0, 0, 0, a])
            });
            DynamicImage::ImageRgba8(alpha)
        }
        _ => return Ok(None),
    };

    let mut body = Cursor::new(Vec::new());
    img.write_to(&mut body, ImageFormat::Png)?;
    Ok(Some(RenderedImage {
        body: body.into_inner(),
        content_type: "image/png".to_string(),
    }))
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::ImageReader::open(path)
        .map_err(|e| NodeError::from(e).with_path(path))?
        .with_guessed_format()
        .map_err(|e| NodeError::from(e).with_path(path))?
        .decode()
        .map_err(|e| NodeError::decode(Some(path.to_path_buf()), e.to_string()))
}

/// MIME type served for a file extension
pub fn content_type_for(path: &Path) -> &'static str {
    match path_extension(path).as_str() {
        "png" => "image/png",
        "apng" => "image/apng",
        "jpg" | "jpeg" | "jfif" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mjpeg" => "video/x-motion-jpeg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "ogg" => "video/ogg",
        "mov" => "video/quicktime",
        "json" => "application/json",
        "txt" | "info" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// `Content-Disposition` value naming the file, quotes escaped
pub fn content_disposition(filename: &str) -> String {
    format!("filename=\"{}\"", filename.replace('"', "\\\""))
}

/// First free `name (n).ext` in `dir`, or the name itself when free
pub fn unique_file_name(dir: &Path, filename: &str) -> String {
    if !dir.join(filename).exists() {
        return filename.to_string();
    }
    let (stem, ext) = split_extension(filename);
    let mut i = 1;
    loop {
        let candidate = format!("{} ({}){}", stem, i, ext);
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        i += 1;
    }
}

/// An upload received by `/jnodes_upload_image`
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub data: Vec<u8>,
    /// Explicit name, falls back to the name of the uploaded file
    pub filename: Option<String>,
    pub original_filename: Option<String>,
    pub upload_type: Option<String>,
    pub subfolder: String,
    pub overwrite: bool,
}

/// Where an upload was stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub name: String,
    pub subfolder: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Write an upload below the directory of its type
///
/// Existing files get a ` (n)` suffix unless `overwrite` is set.
pub fn store_upload(folders: &FolderPaths, request: &UploadRequest) -> Result<UploadedFile> {
    let kind = request
        .upload_type
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_UPLOAD_TYPE.to_string());
    if !is_contained(Path::new(&kind)) {
        return Err(NodeError::invalid_path(&kind, "Upload type escapes the host root"));
    }
    let upload_dir = folders.resolve(&kind);

    let filename = request
        .filename
        .clone()
        .filter(|f| !f.is_empty())
        .or_else(|| request.original_filename.clone())
        .filter(|f| !f.is_empty())
        .ok_or_else(|| NodeError::invalid_input("Upload has no file name"))?;

    let relative = Path::new(&request.subfolder).join(&filename);
    if !is_contained(&relative) || relative.file_name().is_none() {
        return Err(NodeError::invalid_path(
            relative,
            "Upload path escapes the upload directory",
        ));
    }

    let full_path = upload_dir.join(&relative);
    let folder = full_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| upload_dir.clone());
    fs::create_dir_all(&folder).map_err(|e| NodeError::from(e).with_path(&folder))?;

    let name = full_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = if request.overwrite {
        name
    } else {
        unique_file_name(&folder, &name)
    };
    let target = folder.join(&name);
    fs::write(&target, &request.data).map_err(|e| NodeError::from(e).with_path(&target))?;
    info!("Stored upload {:?}", target);

    Ok(UploadedFile {
        name,
        subfolder: request.subfolder.clone(),
        kind,
    })
}

/// Copy a file into a host-relative directory, keeping existing files
pub fn copy_to_directory(folders: &FolderPaths, file: &Path, destination: &str) -> Result<PathBuf> {
    if !is_contained(Path::new(destination)) {
        return Err(NodeError::invalid_path(destination, "Destination escapes the host root"));
    }
    let dir = folders.resolve(destination);
    fs::create_dir_all(&dir).map_err(|e| NodeError::from(e).with_path(&dir))?;

    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| NodeError::invalid_path(file, "Source has no file name"))?;
    let target = dir.join(unique_file_name(&dir, &name));
    fs::copy(file, &target).map_err(|e| NodeError::from(e).with_path(file))?;
    debug!("Copied {:?} to {:?}", file, target);
    Ok(target)
}

/// Show a file in the desktop file manager
pub fn open_in_file_manager(file: &Path) -> Result<()> {
    let mut command = if cfg!(target_os = "windows") {
        let mut c = Command::new("explorer");
        c.arg(format!("/select,{}", file.display()));
        c
    } else if cfg!(target_os = "macos") {
        let mut c = Command::new("open");
        c.arg("-R").arg(file);
        c
    } else {
        let mut c = Command::new("xdg-open");
        c.arg(file.parent().unwrap_or(file));
        c
    };
    command
        .spawn()
        .map_err(|e| NodeError::subprocess(format!("Failed to open file manager: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::error::NodeErrorKind;

    fn setup() -> (tempfile::TempDir, FolderPaths) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("output/run")).unwrap();
        fs::write(dir.path().join("output/run/a.png"), b"png").unwrap();
        let config = BackendConfig::new(dir.path().to_path_buf());
        let folders = FolderPaths::new(&config);
        (dir, folders)
    }

    fn query(kind: &str, subfolder: &str, filename: &str) -> FileQuery {
        FileQuery {
            kind: Some(kind.to_string()),
            subfolder: Some(subfolder.to_string()),
            filename: Some(filename.to_string()),
        }
    }

    #[test]
    fn test_validate_requested_file() {
        let (dir, folders) = setup();
        let found = validate_requested_file(&folders, &query("output", "run", "a.png")).unwrap();
        assert_eq!(found.file, dir.path().join("output/run/a.png"));
        assert_eq!(found.subfolder, "run");

        for bad in ["/etc/passwd", "../secret", "./a.png"] {
            let err = validate_requested_file(&folders, &query("output", "run", bad)).unwrap_err();
            assert_eq!(err.kind, NodeErrorKind::InvalidPath);
        }
        let err = validate_requested_file(&folders, &query("output", "../..", "a.png")).unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::InvalidPath);
        let err = validate_requested_file(&folders, &query("output", "run", "b.png")).unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::NotFound);
        let err = validate_requested_file(&folders, &FileQuery::default()).unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::InvalidInput);
    }

    #[test]
    fn test_validate_rejects_embedded_parent_segments() {
        let (dir, folders) = setup();
        fs::write(dir.path().join("secret.txt"), b"top secret").unwrap();

        for bad in ["x/../../secret.txt", "run/../../secret.txt", "run/a.png/../../../secret.txt"] {
            let err = validate_requested_file(&folders, &query("output", "", bad)).unwrap_err();
            assert_eq!(err.kind, NodeErrorKind::InvalidPath, "{}", bad);
        }
        let nested = validate_requested_file(&folders, &query("output", "", "run/a.png")).unwrap();
        assert_eq!(nested.file, dir.path().join("output/run/a.png"));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_rejects_symlink_out_of_base() {
        let (dir, folders) = setup();
        fs::write(dir.path().join("secret.txt"), b"top secret").unwrap();
        std::os::unix::fs::symlink(dir.path().join("secret.txt"), dir.path().join("output/link.txt"))
            .unwrap();

        let err = validate_requested_file(&folders, &query("output", "", "link.txt")).unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::InvalidPath);
    }

    #[test]
    fn test_unique_file_name() {
        let (dir, _) = setup();
        let run = dir.path().join("output/run");
        assert_eq!(unique_file_name(&run, "b.png"), "b.png");
        assert_eq!(unique_file_name(&run, "a.png"), "a (1).png");
        fs::write(run.join("a (1).png"), b"").unwrap();
        assert_eq!(unique_file_name(&run, "a.png"), "a (2).png");
    }

    #[test]
    fn test_store_upload() {
        let (dir, folders) = setup();
        let mut request = UploadRequest {
            data: b"one".to_vec(),
            original_filename: Some("clip.mp4".to_string()),
            subfolder: "upload_media".to_string(),
            ..Default::default()
        };
        let first = store_upload(&folders, &request).unwrap();
        assert_eq!(first.name, "clip.mp4");
        assert_eq!(first.kind, "input");
        let second = store_upload(&folders, &request).unwrap();
        assert_eq!(second.name, "clip (1).mp4");

        request.overwrite = true;
        request.data = b"two".to_vec();
        store_upload(&folders, &request).unwrap();
        assert_eq!(fs::read(dir.path().join("input/upload_media/clip.mp4")).unwrap(), b"two");

        request.subfolder = "../../outside".to_string();
        assert!(store_upload(&folders, &request).is_err());
        request.subfolder = String::new();
        request.filename = Some("/abs.png".to_string());
        assert!(store_upload(&folders, &request).is_err());
        request.filename = None;
        request.original_filename = None;
        assert!(store_upload(&folders, &request).is_err());
    }

    #[test]
    fn test_render_preview_and_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgba.png");
        RgbaImage::from_pixel(4, 4, image::Rgba([200, 100, 50, 128]))
            .save(&path)
            .unwrap();

        let jpeg = render_preview(&path, "jpeg;50", None).unwrap();
        assert_eq!(jpeg.content_type, "image/jpeg");
        assert_eq!(&jpeg.body[..2], &[0xFF, 0xD8]);

        let webp = render_preview(&path, "jpeg;50", Some("a")).unwrap();
        assert_eq!(webp.content_type, "image/webp");
        assert_eq!(&webp.body[..4], b"RIFF");
        assert_eq!(render_preview(&path, "bmp", None).unwrap().content_type, "image/webp");

        let alpha = render_channel(&path, "a").unwrap().unwrap();
        let decoded = image::load_from_memory(&alpha.body).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(0, 0).0, [0, 0, 0, 128]);

        let rgb = render_channel(&path, "rgb").unwrap().unwrap();
        let decoded = image::load_from_memory(&rgb.body).unwrap();
        assert!(!decoded.color().has_alpha());
        assert!(render_channel(&path, "rgba").unwrap().is_none());
    }

    #[test]
    fn test_copy_to_directory() {
        let (dir, folders) = setup();
        let source = dir.path().join("output/run/a.png");
        let first = copy_to_directory(&folders, &source, "input/picked").unwrap();
        assert_eq!(first, dir.path().join("input/picked/a.png"));
        let second = copy_to_directory(&folders, &source, "input/picked").unwrap();
        assert_eq!(second, dir.path().join("input/picked/a (1).png"));
        assert!(copy_to_directory(&folders, &source, "../elsewhere").is_err());
    }

    #[test]
    fn test_headers() {
        assert_eq!(content_disposition("a \"b\".png"), "filename=\"a \\\"b\\\".png\"");
        assert_eq!(content_type_for(Path::new("x/clip.WEBM")), "video/webm");
        assert_eq!(content_type_for(Path::new("notes")), "application/octet-stream");
    }
}
