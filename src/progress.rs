//! Resumable run state kept in the output root.

use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use tracing::{debug, info, warn};

use crate::storage;

pub const COMPLETED_FILE: &str = "completed_albums.txt";
pub const COOKIES_FILE: &str = "cookies.json";

struct CompletedLog {
    ids: HashSet<String>,
    file: File,
}

/// Completed album ids and the session cookie jar.
///
/// Writes to either file are serialized by their own lock.
pub struct ProgressStore {
    root: PathBuf,
    completed: Mutex<CompletedLog>,
    cookies: Mutex<()>,
}

impl ProgressStore {
    /// Opens (creating if needed) the store under `root`.
    ///
    /// Failure here is fatal to the run.
    pub fn open(root: &Path) -> crate::Result<Self> {
        fs::create_dir_all(root)?;
        let path = root.join(COMPLETED_FILE);

        let mut ids = HashSet::new();
        if path.exists() {
            for line in BufReader::new(File::open(&path)?).lines() {
                let line = line?;
                let line = line.trim();
                if !line.is_empty() {
                    ids.insert(line.to_string());
                }
            }
        }
        info!("{} albums already completed", ids.len());

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            root: root.to_path_buf(),
            completed: Mutex::new(CompletedLog { ids, file }),
            cookies: Mutex::new(()),
        })
    }

    pub fn is_complete(&self, id: &str) -> bool {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .len()
    }

    /// Appends `id` unless it is already recorded.
    pub fn mark_complete(&self, id: &str) -> crate::Result<()> {
        let mut log = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        if log.ids.contains(id) {
            return Ok(());
        }
        writeln!(log.file, "{}", id)?;
        log.file.flush()?;
        log.ids.insert(id.to_string());
        debug!("recorded {} as complete", id);
        Ok(())
    }

    /// Saved cookies; a missing or unreadable file yields none.
    pub fn load_cookies(&self) -> BTreeMap<String, String> {
        let path = self.root.join(COOKIES_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&text) {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!("ignoring unreadable {}: {}", path.display(), e);
                BTreeMap::new()
            }
        }
    }

    pub fn save_cookies(&self, cookies: &BTreeMap<String, String>) -> crate::Result<()> {
        let _guard = self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.root.join(COOKIES_FILE);
        let temp = storage::temp_path(&path);
        fs::write(&temp, serde_json::to_string_pretty(cookies)?)?;
        fs::rename(&temp, &path)?;
        Ok(())
    }
}
