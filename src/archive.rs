//! Archive Organizer
//!
//! Decides where a stored file lives (`root/YEAR/MM_MonthName/name`) and moves
//! staged bytes there without ever replacing an existing file.

use std::io;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::hasher::Fingerprint;

const UNNAMED: &str = "unnamed";

/// Suffix lengths tried, in order, after the plain name collides.
/// 64 is the full fingerprint.
const SUFFIX_LENGTHS: [usize; 3] = [8, 16, 64];

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("Target already exists: {0}")]
    Occupied(PathBuf),

    #[error("Failed to place file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ArchiveOrganizer {
    root: PathBuf,
}

impl ArchiveOrganizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of an archive-relative path
    pub fn absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Candidate archive-relative path for a file.
    ///
    /// `attempt` 0 is the plain name; later attempts add a fingerprint suffix
    /// of growing length. Returns `None` once every form has been tried.
    pub fn plan(
        &self,
        file_name: &str,
        date: DateTime<Utc>,
        fingerprint: &Fingerprint,
        attempt: usize,
    ) -> Option<String> {
        let name = sanitize_file_name(file_name);
        let name = match attempt {
            0 => name,
            n => {
                let len = *SUFFIX_LENGTHS.get(n - 1)?;
                with_suffix(&name, &fingerprint.short(len))
            }
        };
        Some(format!("{}/{}", month_dir(date), name))
    }

    /// Move `staged` to `relative`, refusing to replace anything there
    pub async fn place(&self, staged: &Path, relative: &str) -> Result<PathBuf, PlacementError> {
        let target = self.absolute(relative);
        let io_err = |source| PlacementError::Io {
            path: target.clone(),
            source,
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        if tokio::fs::try_exists(&target).await.map_err(io_err)? {
            return Err(PlacementError::Occupied(target.clone()));
        }

        match tokio::fs::rename(staged, &target).await {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                copy_then_rename(staged, &target).await.map_err(io_err)?;
            }
            Err(e) => return Err(io_err(e)),
        }

        tracing::debug!(
            staged = %staged.display(),
            target = %target.display(),
            "Placed file in archive"
        );
        Ok(target)
    }
}

/// `2024/03_March`
pub fn month_dir(date: DateTime<Utc>) -> String {
    date.format("%Y/%m_%B").to_string()
}

/// Final path component only; empty or dot-only names become `unnamed`
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = Path::new(&normalized)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .last()
        .unwrap_or("")
        .trim();

    if last.is_empty() || last.chars().all(|c| c == '.') {
        UNNAMED.to_string()
    } else {
        last.to_string()
    }
}

/// Insert `_suffix` before the extension
fn with_suffix(name: &str, suffix: &str) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &name[..dot], suffix, &name[dot..]),
        _ => format!("{name}_{suffix}"),
    }
}

/// Guess a MIME type from the file name
pub fn mime_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    // EXDEV
    e.raw_os_error() == Some(18)
}

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    e.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

/// Cross-filesystem move: copy next to the target, rename into place, then
/// drop the source
async fn copy_then_rename(staged: &Path, target: &Path) -> io::Result<()> {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = target.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::copy(staged, &temp).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    let synced = match tokio::fs::File::open(&temp).await {
        Ok(file) => file.sync_all().await,
        Err(e) => Err(e),
    };
    if let Err(e) = synced {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&temp, target).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e);
    }
    tokio::fs::remove_file(staged).await
}
