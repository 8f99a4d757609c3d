//! Albums and images that did not make it, kept for a retry pass or the log.

use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use crate::{download::ImageRef, site::AlbumRef};

pub const FAILED_FILE: &str = "failed_items.log";

#[derive(Clone, Debug)]
pub struct FailedAlbum {
    pub album: AlbumRef,
    pub error: String,
}

#[derive(Clone, Debug)]
pub struct FailedImage {
    pub image: ImageRef,
    pub album: AlbumRef,
    pub album_name: String,
    pub reason: String,
}

/// What to do with failures once the crawl is over.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FailurePolicy {
    /// Ask on a terminal, otherwise log.
    #[default]
    Ask,
    Retry,
    Log,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(FailurePolicy::Ask),
            "retry" => Ok(FailurePolicy::Retry),
            "log" => Ok(FailurePolicy::Log),
            other => Err(format!("unknown failure policy {:?}", other)),
        }
    }
}

#[derive(Debug, Default)]
pub struct FailureList {
    albums: Mutex<Vec<FailedAlbum>>,
    images: Mutex<Vec<FailedImage>>,
}

impl FailureList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn album_failed(&self, album: &AlbumRef, error: impl Into<String>) {
        self.albums
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FailedAlbum {
                album: album.clone(),
                error: error.into(),
            });
    }

    pub fn image_failed(&self, failed: FailedImage) {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failed);
    }

    pub fn album_count(&self) -> usize {
        self.albums.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.album_count() == 0 && self.image_count() == 0
    }

    /// Empties the album list for a retry pass.
    pub fn take_albums(&self) -> Vec<FailedAlbum> {
        std::mem::take(&mut *self.albums.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn take_images(&self) -> Vec<FailedImage> {
        std::mem::take(&mut *self.images.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn render(&self) -> String {
        let mut text = String::from("=== Failed albums ===\n");
        for failed in self.albums.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            let _ = writeln!(text, "URL: {}", failed.album.url);
            let _ = writeln!(text, "Error: {}\n", failed.error);
        }

        text.push_str("=== Failed images ===\n");
        for failed in self.images.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            let _ = writeln!(text, "URL: {}", failed.image.url);
            let _ = writeln!(text, "Save Path: {}", failed.image.dest.display());
            let _ = writeln!(text, "Album URL: {}", failed.album.url);
            let _ = writeln!(text, "Album Name: {}", failed.album_name);
            let _ = writeln!(text, "Error: {}\n", failed.reason);
        }
        text
    }

    /// Writes `failed_items.log` under `root`, or nothing when the list is empty.
    pub fn write_log(&self, root: &Path) -> crate::Result<Option<PathBuf>> {
        if self.is_empty() {
            return Ok(None);
        }
        let path = root.join(FAILED_FILE);
        fs::write(&path, self.render())?;
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use url::Url;

    use super::{FailedImage, FailureList, FailurePolicy, FAILED_FILE};
    use crate::{
        download::ImageRef,
        fetch::Page,
        site::{AlbumRef, ListingSeed},
    };

    fn album(path: &str) -> AlbumRef {
        let listing = Page::new(Url::parse("https://sifang.lat/").unwrap(), "");
        AlbumRef::new(
            listing.url.join(path).unwrap(),
            None,
            &listing,
            &ListingSeed::new(listing.url.clone()),
        )
    }

    #[test]
    fn empty_lists_write_nothing() {
        let root = tempfile::tempdir().unwrap();
        assert_eq!(None, FailureList::new().write_log(root.path()).unwrap());
        assert!(!root.path().join(FAILED_FILE).exists());
    }

    #[test]
    fn log_lists_albums_then_images() {
        let failures = FailureList::new();
        failures.album_failed(&album("/albums/a"), "Gave up");
        failures.image_failed(FailedImage {
            image: ImageRef {
                url: Url::parse("https://cdn.example/3.jpg").unwrap(),
                dest: PathBuf::from("/out/B/003.jpg"),
                index: 3,
            },
            album: album("/albums/b"),
            album_name: "B".into(),
            reason: "server answered 404 Not Found".into(),
        });

        let root = tempfile::tempdir().unwrap();
        let path = failures.write_log(root.path()).unwrap().unwrap();
        let text = std::fs::read_to_string(path).unwrap();

        let albums = text.find("URL: https://sifang.lat/albums/a").unwrap();
        let images = text.find("=== Failed images ===").unwrap();
        assert!(albums < images);
        assert!(text.contains("Save Path: /out/B/003.jpg"));
        assert!(text.contains("Album Name: B"));
    }

    #[test]
    fn taking_drains_the_list() {
        let failures = FailureList::new();
        failures.album_failed(&album("/albums/a"), "x");
        assert_eq!(1, failures.take_albums().len());
        assert!(failures.is_empty());
    }

    #[test]
    fn parses_policies() {
        assert_eq!(Ok(FailurePolicy::Retry), "retry".parse());
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }
}
