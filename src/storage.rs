use std::path::{Path, PathBuf};

use url::Url;

use crate::site::AlbumRef;

/// Longest directory name, in characters.
const MAX_NAME_LEN: usize = 50;

/// Image extensions kept from the source url; anything else is saved as jpg.
static IMAGE_EXTENSIONS: &[&str] = &["bmp", "gif", "jpeg", "jpg", "png", "webp"];

/// Maps albums and images to their place under the output root.
///
/// The same album and sequence index always map to the same path, so two
/// workers never write one file.
#[derive(Clone, Debug)]
pub struct StorageProvider {
    root: PathBuf,
}

impl StorageProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, album: &AlbumRef) -> PathBuf {
        match album.group.as_deref().and_then(sanitize) {
            Some(group) => self.root.join(group),
            None => self.root.clone(),
        }
    }

    /// `<root>/<group>/<name>`
    pub fn album_dir(&self, album: &AlbumRef, name: &str) -> PathBuf {
        self.group_dir(album).join(name)
    }

    /// `<root>/<group>/<name>.zip`
    pub fn archive_path(&self, album: &AlbumRef, name: &str) -> PathBuf {
        self.group_dir(album).join(format!("{}.zip", name))
    }

    /// `<album dir>/<NNN>.<ext>`, counting from 1.
    pub fn image_path(album_dir: &Path, index: usize, url: &Url) -> PathBuf {
        album_dir.join(format!("{:03}.{}", index, image_extension(url)))
    }
}

/// The sibling a download is written to before it is renamed into place.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    name.into()
}

/// Makes a string usable as one path segment.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !c.is_control())
        .collect();
    let capped: String = cleaned.trim().chars().take(MAX_NAME_LEN).collect();
    let capped = capped.trim().trim_end_matches('.').trim_end();

    if capped.is_empty() || capped == "." {
        None
    } else {
        Some(capped.to_string())
    }
}

/// Directory name for an album.
///
/// Prefers `title`, and falls back to `album_<last url segment>`.
pub fn album_name(title: Option<&str>, album: &AlbumRef) -> String {
    if let Some(name) = title.and_then(sanitize) {
        return name;
    }

    let tail = album
        .url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|tail| {
            urlencoding::decode(tail)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| tail.to_string())
        })
        .unwrap_or_default();

    sanitize(&format!("album_{}", tail)).unwrap_or_else(|| "album".to_string())
}

fn image_extension(url: &Url) -> String {
    name_from_url(url.path())
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .filter(|extension| IMAGE_EXTENSIONS.contains(&extension.as_str()))
        .unwrap_or_else(|| "jpg".to_string())
}

fn name_from_url(s: &str) -> Option<&str> {
    // Urls may have parameters, e.g. ?timestamp=2
    if s.ends_with('/') {
        return None;
    }

    let s = match s.rfind('/') {
        Some(idx) => &s[(idx + 1)..],
        None => s,
    };

    let s = match s.rfind('?') {
        Some(idx) => &s[..idx],
        None => s,
    };

    if s.is_empty() {
        return None;
    }

    // Script names like fullimg.php say nothing about the file.
    let extension = match s.rfind('.') {
        Some(idx) => &s[idx..],
        None => return Some(s),
    };

    match extension {
        ".php" | ".html" => None,
        _ => Some(s),
    }
}
