use std::fs;
use std::path::{Path, PathBuf};

use anyhow::bail;

const MEMORY_PREFIX: &str = "sqlite::memory:";
const URL_PREFIX: &str = "sqlite://";

/// Where a `sqlite:` connection URL points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteLocation {
    Memory,
    File(PathBuf),
}

impl SqliteLocation {
    /// Accepts `sqlite::memory:` and `sqlite://<path>[?options]`.
    pub fn parse(url: &str) -> anyhow::Result<Self> {
        if url.starts_with(MEMORY_PREFIX) {
            return Ok(SqliteLocation::Memory);
        }
        let Some(rest) = url.strip_prefix(URL_PREFIX) else {
            bail!("sqlite path must start with `sqlite://` or use `sqlite::memory:`");
        };
        let path_part = rest.split_once('?').map(|(path, _)| path).unwrap_or(rest);
        if path_part.is_empty() {
            bail!("sqlite path is missing a filesystem component after `sqlite://`");
        }
        Ok(SqliteLocation::File(normalize_drive_path(path_part)))
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, SqliteLocation::Memory)
    }

    /// Creates the database file's parent directory when missing.
    pub fn ensure_parent_dir(&self) -> anyhow::Result<()> {
        if let SqliteLocation::File(path) = self {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            SqliteLocation::Memory => None,
            SqliteLocation::File(path) => Some(path),
        }
    }
}

/// `sqlite:///C:/data/watch.db` carries a spurious slash before the drive letter.
fn normalize_drive_path(path_part: &str) -> PathBuf {
    let bytes = path_part.as_bytes();
    let slash_then_drive = bytes.first() == Some(&b'/')
        && bytes.get(1).is_some_and(u8::is_ascii_alphabetic)
        && bytes.get(2) == Some(&b':');
    let path_part = if slash_then_drive { &path_part[1..] } else { path_part };

    #[cfg(windows)]
    {
        // `C:/x` becomes the drive-relative `C:x` so runs stay under the cwd.
        let bytes = path_part.as_bytes();
        if bytes.get(1) == Some(&b':') && matches!(bytes.get(2), Some(b'/') | Some(b'\\')) {
            let mut normalized = String::from(&path_part[..2]);
            normalized.push_str(&path_part[3..]);
            return PathBuf::from(normalized);
        }
    }

    PathBuf::from(path_part)
}
