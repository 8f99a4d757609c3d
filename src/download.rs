//! Fetching images and archives to disk.
//!
//! Every file is written to a `.tmp` sibling, validated there, and only then
//! renamed onto its final path.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};
use url::Url;
use zip::result::ZipError;

use crate::{
    config::Settings,
    error::Error,
    fetch::{self, Fetcher},
    stats::RunStats,
    storage,
    waiter::{Backoff, Band},
};

/// Smallest archive accepted, and the tolerance against a declared length.
const ARCHIVE_SLACK: u64 = 1024;

/// How much of an archive is sniffed for an html error page.
const SNIFF_LEN: usize = 512;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub url: Url,
    pub dest: PathBuf,
    /// Position in the album, counting from 1.
    pub index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Downloaded(u64),
    AlreadyPresent,
    Failed(String),
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct DownloadResult {
    pub image: ImageRef,
    pub outcome: Outcome,
}

impl DownloadResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Downloaded(_) | Outcome::AlreadyPresent)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DownloadPolicy {
    pub max_attempts: u32,
    pub verify: bool,
    pub before: Band,
    pub after: Band,
    /// Wait after a download fails validation.
    pub corrupt: Band,
    pub backoff: Backoff,
}

impl DownloadPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            verify: settings.verify,
            before: settings.image_delay,
            after: settings.post_delay,
            corrupt: Band::secs(3.0, 5.0),
            backoff: Backoff::downloads(),
        }
    }
}

enum Attempt {
    Done(u64),
    /// Definite failure, not worth another attempt.
    Rejected(String),
    /// Written but failed validation.
    Corrupt,
    Retry { connection_reset: bool },
}

pub struct DownloadWorker<'a> {
    fetcher: &'a Fetcher,
    stats: &'a RunStats,
    policy: DownloadPolicy,
}

impl<'a> DownloadWorker<'a> {
    pub fn new(fetcher: &'a Fetcher, stats: &'a RunStats, policy: DownloadPolicy) -> Self {
        Self {
            fetcher,
            stats,
            policy,
        }
    }

    pub fn download(&self, image: ImageRef) -> DownloadResult {
        let outcome = self.download_image(&image);
        match &outcome {
            Outcome::Downloaded(bytes) => self.stats.image_finished(Some(*bytes)),
            Outcome::AlreadyPresent => self.stats.image_finished(Some(0)),
            Outcome::Failed(reason) => {
                warn!("{} failed: {}", image.url, reason);
                self.stats.image_finished(None);
            }
            Outcome::Cancelled => {}
        }
        DownloadResult { image, outcome }
    }

    fn download_image(&self, image: &ImageRef) -> Outcome {
        if image.dest.exists() {
            if !self.policy.verify {
                debug!("{} exists, skipping", image.dest.display());
                return Outcome::AlreadyPresent;
            }
            match validate_image(&image.dest) {
                Ok(()) => {
                    debug!("{} exists and decodes, skipping", image.dest.display());
                    return Outcome::AlreadyPresent;
                }
                Err(e) => info!("{} is damaged ({}), downloading again", image.dest.display(), e),
            }
        }

        self.with_retries(&image.url, |response| {
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if !content_type.starts_with("image/") {
                return Attempt::Rejected(format!("expected an image, got {:?}", content_type));
            }

            match persist(response, &image.dest, validate_image) {
                Ok(bytes) => Attempt::Done(bytes),
                Err(Error::Decode(e)) => {
                    warn!("{} did not decode: {}", image.url, e);
                    Attempt::Corrupt
                }
                Err(e) => {
                    warn!("writing {} failed: {}", image.dest.display(), e);
                    Attempt::Retry {
                        connection_reset: false,
                    }
                }
            }
        })
    }

    /// Downloads an album archive to `dest`.
    pub fn download_archive(&self, url: &Url, dest: &Path) -> Outcome {
        if dest.exists() {
            let size = fs::metadata(dest).map(|meta| meta.len()).unwrap_or(0);
            if !self.policy.verify || size > ARCHIVE_SLACK {
                debug!("{} exists, skipping", dest.display());
                self.stats.image_finished(Some(0));
                return Outcome::AlreadyPresent;
            }
            info!("{} is only {} bytes, downloading again", dest.display(), size);
            if let Err(e) = fs::remove_file(dest) {
                self.stats.image_finished(None);
                return Outcome::Failed(e.to_string());
            }
        }

        let outcome = self.with_retries(url, |response| {
            let declared = response.content_length();
            match persist(response, dest, |path| validate_archive(path, declared)) {
                Ok(bytes) => Attempt::Done(bytes),
                Err(Error::Archive(e)) => {
                    warn!("{} is not a usable archive: {}", url, e);
                    Attempt::Corrupt
                }
                Err(e) => {
                    warn!("writing {} failed: {}", dest.display(), e);
                    Attempt::Retry {
                        connection_reset: false,
                    }
                }
            }
        });

        match &outcome {
            Outcome::Downloaded(bytes) => self.stats.image_finished(Some(*bytes)),
            Outcome::Failed(reason) => {
                warn!("{} failed: {}", url, reason);
                self.stats.image_finished(None);
            }
            _ => {}
        }
        outcome
    }

    fn with_retries(
        &self,
        url: &Url,
        mut handle: impl FnMut(reqwest::blocking::Response) -> Attempt,
    ) -> Outcome {
        let waiter = self.fetcher.waiter();
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            if waiter.pause(self.policy.before).is_err() {
                return Outcome::Cancelled;
            }

            let result = match self.fetcher.get(url) {
                Ok(response) if response.status().is_success() => handle(response),
                Ok(response) if !fetch::is_retryable(response.status()) => {
                    Attempt::Rejected(format!("server answered {}", response.status()))
                }
                Ok(response) => {
                    warn!(
                        "{} answered {} ({}/{})",
                        url,
                        response.status(),
                        attempt,
                        max_attempts
                    );
                    Attempt::Retry {
                        connection_reset: false,
                    }
                }
                Err(Error::Cancelled) => return Outcome::Cancelled,
                Err(e) => {
                    warn!("download of {} failed ({}/{}): {}", url, attempt, max_attempts, e);
                    Attempt::Retry {
                        connection_reset: matches!(&e, Error::Network(e) if fetch::is_connection_reset(e)),
                    }
                }
            };

            let wait = match result {
                Attempt::Done(bytes) => {
                    if waiter.pause(self.policy.after).is_err() {
                        return Outcome::Cancelled;
                    }
                    return Outcome::Downloaded(bytes);
                }
                Attempt::Rejected(reason) => return Outcome::Failed(reason),
                Attempt::Corrupt => self.policy.corrupt.sample(&mut rand::rng()),
                Attempt::Retry { connection_reset } => {
                    self.policy
                        .backoff
                        .delay(attempt, connection_reset, &mut rand::rng())
                }
            };

            if attempt < max_attempts && waiter.sleep(wait).is_err() {
                return Outcome::Cancelled;
            }
        }

        Outcome::Failed(format!("gave up after {} attempts", max_attempts))
    }
}

/// Copies `reader` to `dest` through a temporary file.
///
/// Nothing is left at either path unless `validate` accepts the temporary file.
pub fn persist<R: Read>(
    mut reader: R,
    dest: &Path,
    validate: impl FnOnce(&Path) -> crate::Result<()>,
) -> crate::Result<u64> {
    let temp = storage::temp_path(dest);

    match write_validated(&mut reader, &temp, validate) {
        Ok(bytes) => {
            fs::rename(&temp, dest)?;
            Ok(bytes)
        }
        Err(e) => {
            let _ = fs::remove_file(&temp);
            Err(e)
        }
    }
}

fn write_validated<R: Read>(
    reader: &mut R,
    temp: &Path,
    validate: impl FnOnce(&Path) -> crate::Result<()>,
) -> crate::Result<u64> {
    let mut file = File::create(temp)?;
    let bytes = io::copy(reader, &mut file)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);
    validate(temp)?;
    Ok(bytes)
}

pub fn validate_image(path: &Path) -> crate::Result<()> {
    image::load_from_memory(&fs::read(path)?)?;
    Ok(())
}

pub fn validate_archive(path: &Path, declared: Option<u64>) -> crate::Result<()> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)?;
    let head = String::from_utf8_lossy(&head).to_ascii_lowercase();
    if ["<!doctype html", "<html", "<head"]
        .iter()
        .any(|marker| head.contains(marker))
    {
        return Err(ZipError::InvalidArchive("received an html page").into());
    }

    let size = fs::metadata(path)?.len();
    if size < ARCHIVE_SLACK {
        return Err(ZipError::InvalidArchive("file is too small").into());
    }
    if let Some(declared) = declared.filter(|&declared| declared > 0) {
        if size.abs_diff(declared) > ARCHIVE_SLACK {
            return Err(ZipError::InvalidArchive("size differs from content length").into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Read},
        sync::Arc,
        time::Duration,
    };

    use super::{persist, validate_archive, DownloadPolicy, DownloadWorker, ImageRef, Outcome};
    use crate::{
        fetch::tests::{fetcher_for, quiet_settings},
        stats::RunStats,
        testing::{png_bytes, Fixture, ManualClock, Reply},
        waiter::{Backoff, Band},
    };

    fn policy(verify: bool) -> DownloadPolicy {
        DownloadPolicy {
            verify,
            backoff: Backoff {
                jitter: Band::zero(),
                reset: Band::zero(),
                ..Backoff::downloads()
            },
            ..DownloadPolicy::from_settings(&quiet_settings())
        }
    }

    fn image(fixture: &Fixture, path: &str, dest: &std::path::Path) -> ImageRef {
        ImageRef {
            url: fixture.url(path),
            dest: dest.to_path_buf(),
            index: 1,
        }
    }

    #[test]
    fn downloads_and_validates_images() {
        let fixture = Fixture::start();
        fixture.route("/1.png", Reply::png());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001.png");

        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));
        let stats = RunStats::hidden();
        let worker = DownloadWorker::new(&fetcher, &stats, policy(false));

        let result = worker.download(image(&fixture, "/1.png", &dest));
        assert_eq!(Outcome::Downloaded(png_bytes().len() as u64), result.outcome);
        assert_eq!(png_bytes(), std::fs::read(&dest).unwrap());
        assert!(!dir.path().join("001.png.tmp").exists());
        assert_eq!(1, stats.snapshot().images_done);
    }

    #[test]
    fn html_instead_of_an_image_is_a_failure() {
        let fixture = Fixture::start();
        fixture.route("/1.jpg", Reply::html("<html>blocked</html>"));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001.jpg");

        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));
        let stats = RunStats::hidden();
        let worker = DownloadWorker::new(&fetcher, &stats, policy(false));

        let result = worker.download(image(&fixture, "/1.jpg", &dest));
        assert!(matches!(result.outcome, Outcome::Failed(_)));
        assert!(!dest.exists());
        assert_eq!(1, fixture.hits("/1.jpg"));
        assert_eq!(1, stats.snapshot().images_failed);
    }

    #[test]
    fn corrupt_images_never_reach_the_destination() {
        let fixture = Fixture::start();
        fixture.route("/1.png", Reply::ok("image/png", b"\x89PNG truncated".to_vec()));
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001.png");

        let clock = Arc::new(ManualClock::new());
        let fetcher = fetcher_for(&fixture, clock.clone());
        let stats = RunStats::hidden();
        let worker = DownloadWorker::new(&fetcher, &stats, policy(false));

        let result = worker.download(image(&fixture, "/1.png", &dest));
        assert!(matches!(result.outcome, Outcome::Failed(_)));
        assert_eq!(3, fixture.hits("/1.png"));
        assert!(!dest.exists());
        assert!(!dir.path().join("001.png.tmp").exists());
        // Two waits from the 3..5s band between three attempts.
        assert!(clock.elapsed() >= Duration::from_secs(6));
        assert!(clock.elapsed() <= Duration::from_secs(10));
    }

    #[test]
    fn existing_files_are_skipped_without_a_request() {
        let fixture = Fixture::start();
        fixture.route("/1.png", Reply::png());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001.png");
        std::fs::write(&dest, b"whatever").unwrap();

        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));
        let stats = RunStats::hidden();

        let lenient = DownloadWorker::new(&fetcher, &stats, policy(false));
        let result = lenient.download(image(&fixture, "/1.png", &dest));
        assert_eq!(Outcome::AlreadyPresent, result.outcome);
        assert_eq!(0, fixture.total_hits());

        // With verification on, the undecodable file is fetched again.
        let strict = DownloadWorker::new(&fetcher, &stats, policy(true));
        let result = strict.download(image(&fixture, "/1.png", &dest));
        assert!(matches!(result.outcome, Outcome::Downloaded(_)));
        assert_eq!(1, fixture.hits("/1.png"));

        let result = strict.download(image(&fixture, "/1.png", &dest));
        assert_eq!(Outcome::AlreadyPresent, result.outcome);
        assert_eq!(1, fixture.hits("/1.png"));
    }

    #[test]
    fn server_errors_are_retried() {
        let fixture = Fixture::start();
        fixture.routes("/1.png", vec![Reply::status(503), Reply::png()]);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001.png");

        let clock = Arc::new(ManualClock::new());
        let fetcher = fetcher_for(&fixture, clock.clone());
        let stats = RunStats::hidden();
        let worker = DownloadWorker::new(&fetcher, &stats, policy(false));

        let result = worker.download(image(&fixture, "/1.png", &dest));
        assert!(result.is_success());
        assert_eq!(2, fixture.hits("/1.png"));
        assert_eq!(Duration::from_secs(5), clock.elapsed());
    }

    struct BrokenReader(usize);

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0 == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
            }
            let n = self.0.min(buf.len());
            buf[..n].fill(7);
            self.0 -= n;
            Ok(n)
        }
    }

    #[test]
    fn interrupted_writes_leave_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("001.jpg");

        let result = persist(BrokenReader(4096), &dest, |_| Ok(()));
        assert!(matches!(result, Err(crate::Error::Io(_))));
        assert!(!dest.exists());
        assert!(!dir.path().join("001.jpg.tmp").exists());
    }

    #[test]
    fn archives_are_sniffed_and_sized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.zip");

        std::fs::write(&path, format!("<!DOCTYPE html><html>{}</html>", "x".repeat(4096))).unwrap();
        assert!(validate_archive(&path, None).is_err());

        std::fs::write(&path, vec![b'P'; 100]).unwrap();
        assert!(validate_archive(&path, None).is_err());

        std::fs::write(&path, vec![b'P'; 8192]).unwrap();
        assert!(validate_archive(&path, None).is_ok());
        assert!(validate_archive(&path, Some(8000)).is_ok());
        assert!(validate_archive(&path, Some(20_000)).is_err());
    }
}
