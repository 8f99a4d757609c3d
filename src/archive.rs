use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};

use tracing::{info, warn};
use zip::ZipArchive;

use crate::cancel::CancelToken;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub extracted: usize,
    pub failed: usize,
    pub deleted: usize,
}

/// Every `.zip` below `root`.
pub fn find_archives(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false)
            {
                found.push(path);
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Unpacks `path` next to itself.
pub fn extract(path: &Path, delete_after: bool) -> crate::Result<bool> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    ZipArchive::new(File::open(path)?)?.extract(dir)?;
    info!("extracted {}", path.display());

    if delete_after {
        fs::remove_file(path)?;
        info!("deleted {}", path.display());
    }
    Ok(delete_after)
}

pub fn extract_all(root: &Path, delete_after: bool, cancel: &CancelToken) -> crate::Result<ExtractSummary> {
    let mut summary = ExtractSummary::default();

    for path in find_archives(root)? {
        if cancel.is_cancelled() {
            break;
        }
        match extract(&path, delete_after) {
            Ok(deleted) => {
                summary.extracted += 1;
                summary.deleted += deleted as usize;
            }
            Err(e) => {
                warn!("unable to extract {}: {}", path.display(), e);
                summary.failed += 1;
            }
        }
    }

    Ok(summary)
}
