//! Source enumeration
//!
//! Finds backup candidates below a mounted device directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

pub const PHOTO_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "gif", "bmp", "webp", "tiff", "raw", "cr2", "nef",
    "dng",
];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "avi", "mkv", "m4v", "mpg", "mpeg", "wmv", "flv", "webm",
];

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Source path does not exist: {0}")]
    NotFound(PathBuf),
    #[error("Source path is not a directory: {0}")]
    NotDirectory(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

/// A file offered for backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateFile {
    pub path: PathBuf,
    pub size: u64,
    /// Filesystem modification time
    pub modified: Option<DateTime<Utc>>,
    /// Capture time from the photo's EXIF block
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

impl CandidateFile {
    /// Build a candidate from the file's current metadata
    pub async fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let exif_path = path.clone();
        let captured_at = tokio::task::spawn_blocking(move || exif_capture_time(&exif_path))
            .await
            .ok()
            .flatten();
        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            captured_at,
            path,
        })
    }

    /// Date the archive folder is derived from: EXIF capture time, else mtime
    pub fn capture_time(&self) -> Option<DateTime<Utc>> {
        self.captured_at.or(self.modified)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Photo or video, judged by extension
pub fn media_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if PHOTO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Photo)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// `DateTimeOriginal`, else `DateTime`, from a photo's EXIF data.
///
/// EXIF stamps carry no zone and are taken as UTC. Videos, files without
/// EXIF and unparsable stamps yield `None`.
pub fn exif_capture_time(path: &Path) -> Option<DateTime<Utc>> {
    if media_kind(path) != Some(MediaKind::Photo) {
        return None;
    }
    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;

    [exif::Tag::DateTimeOriginal, exif::Tag::DateTime]
        .into_iter()
        .filter_map(|tag| exif.get_field(tag, exif::In::PRIMARY))
        .find_map(|field| match &field.value {
            exif::Value::Ascii(values) => values
                .first()
                .and_then(|raw| exif::DateTime::from_ascii(raw).ok())
                .and_then(|stamp| {
                    let naive = NaiveDate::from_ymd_opt(
                        i32::from(stamp.year),
                        u32::from(stamp.month),
                        u32::from(stamp.day),
                    )?
                    .and_hms_opt(
                        u32::from(stamp.hour),
                        u32::from(stamp.minute),
                        u32::from(stamp.second),
                    )?;
                    Some(Utc.from_utc_datetime(&naive))
                }),
            _ => None,
        })
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<CandidateFile>,
    /// Unreadable entries and symlinks
    pub skipped: u64,
}

/// Walk `root` for supported media files, sorted by path
pub fn scan_media(root: &Path) -> Result<ScanResult, ScanError> {
    if !root.exists() {
        return Err(ScanError::NotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(ScanError::NotDirectory(root.to_path_buf()));
    }

    let mut result = ScanResult::default();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable entry");
                result.skipped += 1;
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            result.skipped += 1;
            continue;
        }
        if !file_type.is_file() || media_kind(entry.path()).is_none() {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(_) => {
                result.skipped += 1;
                continue;
            }
        };

        result.files.push(CandidateFile {
            path: entry.path().to_path_buf(),
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            captured_at: exif_capture_time(entry.path()),
        });
    }

    result.files.sort_by(|a, b| a.path.cmp(&b.path));

    tracing::info!(
        root = %root.display(),
        files = result.files.len(),
        skipped = result.skipped,
        "Scanned source for media"
    );
    Ok(result)
}

/// Minimal JPEG whose EXIF IFD0 holds a single `DateTime` entry
#[cfg(test)]
pub(crate) fn jpeg_with_exif_date(stamp: &str) -> Vec<u8> {
    let mut value = stamp.as_bytes().to_vec();
    value.push(0);

    // Big-endian TIFF header, IFD0 at offset 8 with one ASCII entry whose
    // value follows the IFD.
    let value_offset: u32 = 8 + 2 + 12 + 4;
    let mut tiff = b"MM\x00\x2a".to_vec();
    tiff.extend_from_slice(&8u32.to_be_bytes());
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&0x0132u16.to_be_bytes());
    tiff.extend_from_slice(&2u16.to_be_bytes());
    tiff.extend_from_slice(&(value.len() as u32).to_be_bytes());
    tiff.extend_from_slice(&value_offset.to_be_bytes());
    tiff.extend_from_slice(&0u32.to_be_bytes());
    tiff.extend_from_slice(&value);

    let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE1];
    jpeg.extend_from_slice(&((2 + 6 + tiff.len()) as u16).to_be_bytes());
    jpeg.extend_from_slice(b"Exif\x00\x00");
    jpeg.extend_from_slice(&tiff);
    jpeg.extend_from_slice(&[0xFF, 0xD9]);
    jpeg
}
