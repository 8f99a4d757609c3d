//! The top of the run: listing discovery feeding the album pool.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, SendTimeoutError, Sender};
use fmtsize::{Conventional, FmtSize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    archive::{self, ExtractSummary},
    cancel::CancelToken,
    config::{Mode, Settings},
    download::{DownloadPolicy, DownloadWorker, Outcome},
    error::Error,
    failures::{FailedAlbum, FailedImage, FailureList},
    fetch::{self, Fetcher},
    paginate::ListingPaginator,
    pipeline::{AlbumOutcome, AlbumPipeline, PipelinePolicy},
    pool,
    progress::ProgressStore,
    site::{AlbumRef, Site, SiteAdapter},
    stats::{Elapsed, RunStats, Snapshot},
    storage::StorageProvider,
    waiter::Clock,
};

/// How often idle album workers re-check whether discovery is over.
const POLL: Duration = Duration::from_millis(500);

/// Counts reported at the end of a run.
#[derive(Debug)]
pub struct Report {
    pub snapshot: Snapshot,
    pub failed_albums: usize,
    pub failed_images: usize,
    pub listing_errors: usize,
    pub cancelled: bool,
    pub elapsed: Elapsed,
}

impl Report {
    pub fn has_failures(&self) -> bool {
        self.failed_albums > 0 || self.failed_images > 0
    }

    /// 0 when everything worked, 1 when something is left to do.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled || self.has_failures() || self.listing_errors > 0 {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.snapshot;
        writeln!(
            f,
            "{} of {} albums done, {} of {} images ({})",
            s.albums_done,
            s.albums_total,
            s.images_done,
            s.images_total,
            s.bytes.fmt_size(Conventional)
        )?;
        write!(
            f,
            "{} failed albums, {} failed images, {} elapsed",
            self.failed_albums, self.failed_images, self.elapsed
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

pub struct Crawler {
    settings: Settings,
    start: Url,
    adapter: Box<dyn SiteAdapter>,
    fetcher: Fetcher,
    store: ProgressStore,
    storage: StorageProvider,
    stats: RunStats,
    failures: FailureList,
    listing_errors: AtomicUsize,
}

impl Crawler {
    /// Opens the progress files and restores saved cookies.
    ///
    /// Errors here are fatal to the run.
    pub fn new(
        settings: Settings,
        start: Url,
        site: Site,
        stats: RunStats,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> crate::Result<Self> {
        let domain = fetch::site_domain(&start)?;
        let adapter = site.adapter(&domain);
        let fetcher = Fetcher::new(&settings, &start, adapter.charset(), clock, cancel)?;
        let store = ProgressStore::open(&settings.output)?;
        let storage = StorageProvider::new(&settings.output);

        let cookies = store.load_cookies();
        if !cookies.is_empty() {
            debug!("restoring {} cookies", cookies.len());
            fetcher.load_cookies(&cookies);
        }

        info!(
            "crawling {} with the {} adapter into {} ({} albums already completed)",
            start,
            adapter.name(),
            settings.output.display(),
            store.completed_count()
        );

        Ok(Self {
            settings,
            start,
            adapter,
            fetcher,
            store,
            storage,
            stats,
            failures: FailureList::new(),
            listing_errors: AtomicUsize::new(0),
        })
    }

    fn cancel(&self) -> &CancelToken {
        self.fetcher.cancel_token()
    }

    fn download_policy(&self) -> DownloadPolicy {
        DownloadPolicy::from_settings(&self.settings)
    }

    fn pipeline(&self) -> AlbumPipeline<'_> {
        AlbumPipeline {
            fetcher: &self.fetcher,
            adapter: self.adapter.as_ref(),
            store: &self.store,
            storage: &self.storage,
            stats: &self.stats,
            failures: &self.failures,
            policy: PipelinePolicy {
                image_workers: self.settings.image_workers,
                album_delay: self.settings.album_delay,
                download: self.download_policy(),
            },
        }
    }

    pub fn run(&self) -> Report {
        info!(
            "{} album workers, {} image workers, {:?} mode",
            self.settings.album_workers, self.settings.image_workers, self.settings.mode
        );

        match self.settings.mode {
            Mode::Batch => self.run_batch(),
            Mode::Pipelined => self.run_pipelined(),
        }

        if let Err(e) = self.store.save_cookies(&self.fetcher.cookies()) {
            warn!("unable to save cookies: {}", e);
        }
        self.report()
    }

    /// Crawls every listing page, then downloads.
    fn run_batch(&self) {
        let mut albums = Vec::new();
        self.discover(|album| {
            albums.push(album);
            true
        });
        info!("{} albums to process", albums.len());

        let pipeline = self.pipeline();
        pool::map_bounded(self.settings.album_workers, albums, self.cancel(), |album| {
            pipeline.process(&album)
        });
    }

    /// Downloads while discovery is still running.
    ///
    /// Workers stop once discovery has finished and the queue is empty.
    fn run_pipelined(&self) {
        let (tx, rx) = bounded::<AlbumRef>(self.settings.album_workers * 2);
        let discovered = AtomicBool::new(false);
        let cancel = self.cancel();
        let pipeline = self.pipeline();

        thread::scope(|scope| {
            let discovered = &discovered;

            scope.spawn(move || {
                self.discover(|album| offer(&tx, album, cancel));
                discovered.store(true, Ordering::SeqCst);
                debug!("discovery finished");
            });

            for _ in 0..self.settings.album_workers {
                let rx = rx.clone();
                let pipeline = &pipeline;
                scope.spawn(move || loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match rx.recv_timeout(POLL) {
                        Ok(album) => {
                            pipeline.process(&album);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if discovered.load(Ordering::SeqCst) && rx.is_empty() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                });
            }
        });
    }

    /// Walks every listing, handing each new album to `emit`.
    ///
    /// Albums already recorded complete are not emitted. Stops early when
    /// `emit` returns false.
    fn discover(&self, mut emit: impl FnMut(AlbumRef) -> bool) {
        let seeds = match self.adapter.listing_seeds(&self.fetcher, &self.start) {
            Ok(seeds) => seeds,
            Err(Error::Cancelled) => return,
            Err(e) => {
                error!("unable to read {}: {}", self.start, e);
                self.listing_errors.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };

        let mut seen = HashSet::new();
        let mut found = 0;
        let mut skipped = 0;

        for seed in seeds {
            if let Some(group) = &seed.group {
                info!("listing {} ({})", seed.url, group);
            }
            let start = seed.url.clone();
            let mut paginator = ListingPaginator::new(
                &self.fetcher,
                self.adapter.as_ref(),
                seed,
                self.settings.listing_delay,
            );

            for listing in paginator.by_ref() {
                let listing = match listing {
                    Ok(listing) => listing,
                    Err(Error::Cancelled) => return,
                    Err(e) => {
                        error!("listing walk ended early: {}", e);
                        self.listing_errors.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                };

                for album in listing.albums {
                    if !seen.insert(album.id().to_string()) {
                        continue;
                    }
                    if self.store.is_complete(album.id()) {
                        skipped += 1;
                        continue;
                    }
                    found += 1;
                    self.stats.albums_found(1);
                    if !emit(album) {
                        return;
                    }
                }
            }
            debug!("{} listing pages walked from {}", paginator.visited(), start);
        }

        info!("{} albums found, {} already completed", found, skipped);
    }

    /// Runs failed albums and failed images once more.
    ///
    /// Both lists are taken up front so an image that fails again during the
    /// album pass is not tried twice. Anything the pass does not get to,
    /// because the run was cancelled, goes back on the lists.
    pub fn retry_failures(&self) -> Report {
        let albums = self.failures.take_albums();
        let images = self.failures.take_images();

        if !albums.is_empty() {
            self.retry_albums(albums);
        }
        if !images.is_empty() {
            self.retry_images(images);
        }

        self.report()
    }

    fn retry_albums(&self, albums: Vec<FailedAlbum>) {
        info!("retrying {} albums", albums.len());
        for _ in &albums {
            self.stats.album_retried();
        }

        let pipeline = self.pipeline();
        let outcomes = pool::map_bounded(
            self.settings.album_workers,
            (0..albums.len()).collect(),
            self.cancel(),
            |idx: usize| (idx, pipeline.process(&albums[idx].album)),
        );

        let mut attempted = vec![false; albums.len()];
        for (idx, outcome) in outcomes {
            let url = &albums[idx].album.url;
            match outcome {
                AlbumOutcome::Completed => info!("retry of {} succeeded", url),
                AlbumOutcome::Cancelled => continue,
                outcome if outcome.is_success() => info!("retry of {} left images behind", url),
                _ => warn!("retry of {} failed again", url),
            }
            attempted[idx] = true;
        }

        for (failed, attempted) in albums.into_iter().zip(attempted) {
            if !attempted {
                self.failures.album_failed(&failed.album, failed.error);
            }
        }
    }

    fn retry_images(&self, images: Vec<FailedImage>) {
        info!("retrying {} images", images.len());
        let worker = DownloadWorker::new(&self.fetcher, &self.stats, self.download_policy());

        // Albums whose every failed image comes through are complete.
        let mut pending: HashMap<String, usize> = HashMap::new();
        for failed in &images {
            self.stats.image_retried();
            *pending.entry(failed.album.id().to_string()).or_default() += 1;
        }

        let results = pool::map_bounded(
            self.settings.image_workers,
            (0..images.len()).collect(),
            self.cancel(),
            |idx: usize| (idx, worker.download(images[idx].image.clone()).outcome),
        );

        let mut outcomes: Vec<Option<Outcome>> = vec![None; images.len()];
        for (idx, outcome) in results {
            outcomes[idx] = Some(outcome);
        }

        let mut succeeded = 0;
        for (mut failed, outcome) in images.into_iter().zip(outcomes) {
            match outcome {
                Some(Outcome::Downloaded(_)) | Some(Outcome::AlreadyPresent) => {
                    succeeded += 1;
                    if let Some(count) = pending.get_mut(failed.album.id()) {
                        *count -= 1;
                    }
                }
                Some(Outcome::Failed(reason)) => {
                    failed.reason = reason;
                    self.failures.image_failed(failed);
                }
                Some(Outcome::Cancelled) | None => self.failures.image_failed(failed),
            }
        }
        info!("{} images recovered", succeeded);

        if !self.cancel().is_cancelled() {
            for (id, remaining) in pending {
                if remaining == 0 {
                    if let Err(e) = self.store.mark_complete(&id) {
                        warn!("unable to record {}: {}", id, e);
                    }
                }
            }
        }
    }

    /// Writes whatever is still failed to `failed_items.log`.
    pub fn write_failure_log(&self) -> crate::Result<Option<PathBuf>> {
        self.failures.write_log(self.storage.root())
    }

    pub fn extract_archives(&self) -> crate::Result<ExtractSummary> {
        archive::extract_all(
            self.storage.root(),
            self.settings.delete_archives,
            self.cancel(),
        )
    }

    pub fn report(&self) -> Report {
        Report {
            snapshot: self.stats.snapshot(),
            failed_albums: self.failures.album_count(),
            failed_images: self.failures.image_count(),
            listing_errors: self.listing_errors.load(Ordering::SeqCst),
            cancelled: self.cancel().is_cancelled(),
            elapsed: self.stats.elapsed(),
        }
    }

    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.stats.suspend(f)
    }

    pub fn finish(&self) {
        self.stats.finish();
    }
}

/// Queues `album`, waiting for room unless the run is cancelled.
fn offer(tx: &Sender<AlbumRef>, album: AlbumRef, cancel: &CancelToken) -> bool {
    let mut album = album;
    loop {
        match tx.send_timeout(album, POLL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if cancel.is_cancelled() {
                    return false;
                }
                album = returned;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Crawler;
    use crate::{
        cancel::CancelToken,
        config::{Mode, Settings},
        fetch::tests::quiet_settings,
        progress::COMPLETED_FILE,
        site::Site,
        stats::RunStats,
        testing::{Fixture, ManualClock, Reply},
    };

    fn site(fixture: &Fixture, albums: usize, broken_image: Option<usize>) {
        let links: String = (1..=albums)
            .map(|n| format!(r#"<a href="/albums/{n}">album {n}</a>"#))
            .collect();
        fixture.route(
            "/list",
            Reply::html(format!("<html><body>{}</body></html>", links)),
        );

        for n in 1..=albums {
            fixture.route(&format!("/albums/{}", n), album_page(n));
            for i in 1..=2 {
                let reply = if broken_image == Some(n) && i == 2 {
                    Reply::status(404)
                } else {
                    Reply::png()
                };
                fixture.route(&format!("/i/{}/{}.png", n, i), reply);
            }
        }
    }

    fn album_page(n: usize) -> Reply {
        Reply::html(format!(
            r#"<html><head><title>Album {n}</title></head><body><article>
               <img src="/i/{n}/1.png"><img src="/i/{n}/2.png"></article></body></html>"#
        ))
    }

    fn settings(root: &std::path::Path, mode: Mode) -> Settings {
        Settings {
            output: root.to_path_buf(),
            mode,
            album_workers: 2,
            image_workers: 3,
            ..quiet_settings()
        }
    }

    fn crawler(fixture: &Fixture, settings: Settings) -> Crawler {
        crawler_with(fixture, settings, CancelToken::new())
    }

    fn crawler_with(fixture: &Fixture, settings: Settings, cancel: CancelToken) -> Crawler {
        Crawler::new(
            settings,
            fixture.url("/list"),
            Site::Generic,
            RunStats::hidden(),
            Arc::new(ManualClock::new()),
            cancel,
        )
        .unwrap()
    }

    fn image_hits(fixture: &Fixture, albums: usize) -> usize {
        (1..=albums)
            .flat_map(|n| (1..=2).map(move |i| format!("/i/{}/{}.png", n, i)))
            .map(|path| fixture.hits(&path))
            .sum()
    }

    #[test]
    fn pipelined_runs_download_everything_once() {
        let fixture = Fixture::start();
        site(&fixture, 5, None);
        let root = tempfile::tempdir().unwrap();

        let report = crawler(&fixture, settings(root.path(), Mode::Pipelined)).run();
        assert_eq!(0, report.exit_code());
        assert_eq!(5, report.snapshot.albums_done);
        assert_eq!(10, report.snapshot.images_done);
        assert_eq!(10, image_hits(&fixture, 5));
        assert!(root.path().join("Album 3/002.png").exists());

        let completed = std::fs::read_to_string(root.path().join(COMPLETED_FILE)).unwrap();
        assert_eq!(5, completed.lines().count());
    }

    #[test]
    fn second_runs_download_nothing() {
        let fixture = Fixture::start();
        site(&fixture, 3, None);
        let root = tempfile::tempdir().unwrap();

        crawler(&fixture, settings(root.path(), Mode::Batch)).run();
        assert_eq!(6, image_hits(&fixture, 3));

        let report = crawler(&fixture, settings(root.path(), Mode::Batch)).run();
        assert_eq!(0, report.snapshot.albums_total);
        assert_eq!(6, image_hits(&fixture, 3));
        for n in 1..=3 {
            assert_eq!(1, fixture.hits(&format!("/albums/{}", n)));
        }
    }

    #[test]
    fn failures_are_logged_and_retried() {
        let fixture = Fixture::start();
        site(&fixture, 2, Some(2));
        let root = tempfile::tempdir().unwrap();
        let crawler = crawler(&fixture, settings(root.path(), Mode::Batch));

        let report = crawler.run();
        assert_eq!(1, report.failed_images);
        assert_eq!(1, report.exit_code());
        assert_eq!(2, report.snapshot.albums_done);

        // The image comes back on the retry pass.
        fixture.route("/i/2/2.png", Reply::png());
        let report = crawler.retry_failures();
        assert_eq!(0, report.exit_code());
        assert_eq!(None, crawler.write_failure_log().unwrap());

        let completed = std::fs::read_to_string(root.path().join(COMPLETED_FILE)).unwrap();
        assert!(completed.contains("/albums/2"));
    }

    #[test]
    fn remaining_failures_go_to_the_log() {
        let fixture = Fixture::start();
        site(&fixture, 1, Some(1));
        let root = tempfile::tempdir().unwrap();
        let crawler = crawler(&fixture, settings(root.path(), Mode::Pipelined));

        crawler.run();
        let report = crawler.retry_failures();
        assert_eq!(1, report.failed_images);

        let path = crawler.write_failure_log().unwrap().unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("/i/1/2.png"));
        assert!(text.contains("Album Name: Album 1"));
    }

    #[test]
    fn cancelled_retries_keep_their_failures() {
        let fixture = Fixture::start();
        site(&fixture, 2, Some(1));
        fixture.route("/albums/2", Reply::status(404));
        let root = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        let crawler = crawler_with(&fixture, settings(root.path(), Mode::Batch), cancel.clone());

        let report = crawler.run();
        assert_eq!(1, report.failed_albums);
        assert_eq!(1, report.failed_images);

        cancel.cancel();
        let report = crawler.retry_failures();
        assert_eq!(1, report.failed_albums);
        assert_eq!(1, report.failed_images);

        let path = crawler.write_failure_log().unwrap().unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("/albums/2"));
        assert!(text.contains("/i/1/2.png"));
    }

    #[test]
    fn images_failing_in_the_album_retry_are_not_tried_twice() {
        let fixture = Fixture::start();
        site(&fixture, 2, Some(2));
        fixture.route("/albums/2", Reply::status(404));
        let root = tempfile::tempdir().unwrap();
        let crawler = crawler(&fixture, settings(root.path(), Mode::Batch));

        let report = crawler.run();
        assert_eq!(1, report.failed_albums);
        assert_eq!(0, fixture.hits("/i/2/2.png"));

        fixture.route("/albums/2", album_page(2));
        let report = crawler.retry_failures();
        assert_eq!(0, report.failed_albums);
        assert_eq!(1, report.failed_images);
        assert_eq!(1, fixture.hits("/i/2/2.png"));
    }

    #[test]
    fn cancelled_runs_stop_and_record_nothing() {
        let fixture = Fixture::start();
        site(&fixture, 3, None);
        let root = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let crawler = crawler_with(&fixture, settings(root.path(), Mode::Pipelined), cancel);

        let report = crawler.run();
        assert!(report.cancelled);
        assert_eq!(1, report.exit_code());
        assert_eq!(0, image_hits(&fixture, 3));
        assert_eq!(0, report.failed_albums);
    }
}
