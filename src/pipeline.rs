//! Processing of a single album: page walk, image list, downloads, bookkeeping.

use std::{
    collections::HashSet,
    fs,
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::{debug, info, warn};
use url::Url;

use crate::{
    download::{DownloadPolicy, DownloadWorker, ImageRef, Outcome},
    error::{Error, ExtractionFailure},
    extract::ImageSet,
    failures::{FailedImage, FailureList},
    fetch::{Fetcher, Page},
    pool,
    progress::ProgressStore,
    site::{AlbumRef, SiteAdapter},
    stats::RunStats,
    storage::{self, StorageProvider},
    waiter::Band,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlbumOutcome {
    /// Already recorded complete by an earlier run.
    Skipped,
    /// Every image is on disk.
    Completed,
    /// The album was processed but some images failed.
    Partial { failed: usize },
    Failed(String),
    Cancelled,
}

impl AlbumOutcome {
    /// Partial albums count: their failed images are retried on their own.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            AlbumOutcome::Skipped | AlbumOutcome::Completed | AlbumOutcome::Partial { .. }
        )
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PipelinePolicy {
    pub image_workers: usize,
    /// Pause before an album's first page.
    pub album_delay: Band,
    pub download: DownloadPolicy,
}

/// Everything one album needs, borrowed from the crawler.
pub struct AlbumPipeline<'a> {
    pub fetcher: &'a Fetcher,
    pub adapter: &'a dyn SiteAdapter,
    pub store: &'a ProgressStore,
    pub storage: &'a StorageProvider,
    pub stats: &'a RunStats,
    pub failures: &'a FailureList,
    pub policy: PipelinePolicy,
}

impl AlbumPipeline<'_> {
    pub fn process(&self, album: &AlbumRef) -> AlbumOutcome {
        if self.store.is_complete(album.id()) {
            debug!("{} already completed", album.url);
            return AlbumOutcome::Skipped;
        }

        let outcome = match self.try_process(album) {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => AlbumOutcome::Cancelled,
            Err(e) => AlbumOutcome::Failed(e.to_string()),
        };

        match &outcome {
            AlbumOutcome::Failed(error) => {
                warn!("album {} failed: {}", album.url, error);
                self.failures.album_failed(album, error.as_str());
                self.stats.album_finished(false);
            }
            AlbumOutcome::Completed | AlbumOutcome::Partial { .. } => {
                self.stats.album_finished(true);
                if let Err(e) = self.store.save_cookies(&self.fetcher.cookies()) {
                    warn!("unable to save cookies: {}", e);
                }
            }
            AlbumOutcome::Skipped | AlbumOutcome::Cancelled => {}
        }
        outcome
    }

    fn try_process(&self, album: &AlbumRef) -> crate::Result<AlbumOutcome> {
        self.fetcher.waiter().pause(self.policy.album_delay)?;
        info!("processing album {}", album.url);

        let first = self
            .fetcher
            .page(&album.url)?
            .ok_or_else(|| Error::Extraction(ExtractionFailure::Metadata, album.url.to_string()))?;

        let title = album.name.clone().or_else(|| self.adapter.album_title(&first));
        let name = storage::album_name(title.as_deref(), album);
        self.stats.album_started(&name);

        if let Some(link) = self.adapter.extract_download_link(&first) {
            return self.download_archive(album, &name, &link);
        }
        if self.adapter.archives_only() {
            return Err(Error::Extraction(
                ExtractionFailure::DownloadLink,
                album.url.to_string(),
            ));
        }

        let urls = self.collect_images(album, first)?;
        if urls.is_empty() {
            return Err(Error::Extraction(
                ExtractionFailure::ImageUrl,
                album.url.to_string(),
            ));
        }

        let dir = self.storage.album_dir(album, &name);
        fs::create_dir_all(&dir)?;

        let images: Vec<ImageRef> = urls
            .into_iter()
            .enumerate()
            .map(|(idx, url)| ImageRef {
                dest: StorageProvider::image_path(&dir, idx + 1, &url),
                url,
                index: idx + 1,
            })
            .collect();

        let total = images.len();
        info!("{}: {} images", name, total);
        self.stats.images_found(total);

        let worker = DownloadWorker::new(self.fetcher, self.stats, self.policy.download);
        let done = AtomicUsize::new(0);
        let cancel = self.fetcher.cancel_token();

        let results = pool::map_bounded(self.policy.image_workers, images, cancel, |image| {
            let result = worker.download(image);
            if result.is_success() {
                let done = done.fetch_add(1, Ordering::SeqCst) + 1;
                self.stats.album_progress(done, total);
            }
            result
        });

        if cancel.is_cancelled()
            || results.len() < total
            || results.iter().any(|result| result.outcome == Outcome::Cancelled)
        {
            info!("{} interrupted", name);
            return Ok(AlbumOutcome::Cancelled);
        }

        let mut failed = 0;
        for result in results {
            if let Outcome::Failed(reason) = result.outcome {
                failed += 1;
                self.failures.image_failed(FailedImage {
                    image: result.image,
                    album: album.clone(),
                    album_name: name.clone(),
                    reason,
                });
            }
        }

        info!("{} done, {}/{} images", name, total - failed, total);
        if failed == 0 {
            self.store.mark_complete(album.id())?;
            Ok(AlbumOutcome::Completed)
        } else {
            Ok(AlbumOutcome::Partial { failed })
        }
    }

    /// Walks the album's own pages, collecting images in first-seen order.
    fn collect_images(&self, album: &AlbumRef, first: Page) -> crate::Result<Vec<Url>> {
        let mut found = ImageSet::new();
        let mut visited = HashSet::new();
        let mut page = first;

        loop {
            visited.insert(page.url.clone());
            let added = self.adapter.extract_album_images(&page, album, &mut found);
            debug!("{} new images on {}", added, page.url);

            let next = match self
                .adapter
                .discover_next_album_page(&page, album)
                .into_url()
            {
                Some(next) if !visited.contains(&next) => next,
                _ => break,
            };

            page = match self.fetcher.page(&next)? {
                Some(page) => page,
                None => break,
            };
        }

        Ok(found.into_vec())
    }

    fn download_archive(
        &self,
        album: &AlbumRef,
        name: &str,
        link: &Url,
    ) -> crate::Result<AlbumOutcome> {
        let dest = self.storage.archive_path(album, name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        self.stats.images_found(1);

        let worker = DownloadWorker::new(self.fetcher, self.stats, self.policy.download);
        match worker.download_archive(link, &dest) {
            Outcome::Downloaded(_) | Outcome::AlreadyPresent => {
                self.stats.album_progress(1, 1);
                self.store.mark_complete(album.id())?;
                Ok(AlbumOutcome::Completed)
            }
            Outcome::Failed(reason) => Ok(AlbumOutcome::Failed(format!("{}: {}", link, reason))),
            Outcome::Cancelled => Ok(AlbumOutcome::Cancelled),
        }
    }
}
