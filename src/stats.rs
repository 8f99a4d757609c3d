use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Local};
use fmtsize::{Conventional, FmtSize};
use indicatif::{ProgressBar, ProgressStyle};

/// A consistent copy of the run counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub albums_total: usize,
    pub albums_done: usize,
    pub albums_failed: usize,
    pub images_total: usize,
    pub images_done: usize,
    pub images_failed: usize,
    pub bytes: u64,
    pub current_album: String,
    /// Percent of the current album's images that are done.
    pub current_progress: u8,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "albums {}/{} | images {}/{} | failed {} | {} | {} {}%",
            self.albums_done,
            self.albums_total,
            self.images_done,
            self.images_total,
            self.albums_failed + self.images_failed,
            self.bytes.fmt_size(Conventional),
            self.current_album,
            self.current_progress,
        )
    }
}

/// Live counters for one run, shared by every worker.
///
/// All updates happen under one lock, and each one repaints the progress line.
pub struct RunStats {
    counters: Mutex<Snapshot>,
    line: ProgressLine,
    started: DateTime<Local>,
}

impl RunStats {
    pub fn new(line: ProgressLine) -> Self {
        Self {
            counters: Mutex::new(Snapshot::default()),
            line,
            started: Local::now(),
        }
    }

    pub fn hidden() -> Self {
        Self::new(ProgressLine::hidden())
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        let snapshot = {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut counters);
            counters.clone()
        };
        self.line.repaint(&snapshot);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn albums_found(&self, count: usize) {
        self.update(|s| s.albums_total += count);
    }

    pub fn album_started(&self, name: &str) {
        self.update(|s| {
            s.current_album = name.to_string();
            s.current_progress = 0;
        });
    }

    pub fn album_finished(&self, success: bool) {
        self.update(|s| {
            if success {
                s.albums_done += 1;
            } else {
                s.albums_failed += 1;
            }
        });
    }

    /// Moves a failed album back to pending before a retry.
    pub fn album_retried(&self) {
        self.update(|s| s.albums_failed = s.albums_failed.saturating_sub(1));
    }

    pub fn images_found(&self, count: usize) {
        self.update(|s| s.images_total += count);
    }

    pub fn image_finished(&self, bytes: Option<u64>) {
        self.update(|s| match bytes {
            Some(bytes) => {
                s.images_done += 1;
                s.bytes += bytes;
            }
            None => s.images_failed += 1,
        });
    }

    pub fn image_retried(&self) {
        self.update(|s| s.images_failed = s.images_failed.saturating_sub(1));
    }

    pub fn album_progress(&self, done: usize, total: usize) {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        self.update(|s| s.current_progress = percent.min(100) as u8);
    }

    pub fn elapsed(&self) -> Elapsed {
        Elapsed(Local::now().signed_duration_since(self.started))
    }

    /// Hides the progress line while `f` talks to the terminal.
    pub fn suspend<R>(&self, f: impl FnOnce() -> R) -> R {
        self.line.0.suspend(f)
    }

    pub fn finish(&self) {
        self.line.finish();
    }
}

/// Elapsed wall time, shown as `H+MM:SS`.
#[derive(Debug)]
pub struct Elapsed(pub chrono::Duration);

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.0;
        write!(
            f,
            "{}+{:02}:{:02}",
            elapsed.num_hours(),
            elapsed.num_minutes() % 60,
            elapsed.num_seconds() % 60
        )
    }
}

/// The single repainted status line on stderr.
pub struct ProgressLine(ProgressBar);

impl ProgressLine {
    pub fn stderr() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}").unwrap());
        bar.enable_steady_tick(Duration::from_millis(250));
        Self(bar)
    }

    pub fn hidden() -> Self {
        Self(ProgressBar::hidden())
    }

    fn repaint(&self, snapshot: &Snapshot) {
        self.0.set_message(snapshot.to_string());
    }

    fn finish(&self) {
        self.0.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::{Elapsed, RunStats};

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(RunStats::hidden());
        stats.images_found(800);

        thread::scope(|scope| {
            for _ in 0..8 {
                let stats = stats.clone();
                scope.spawn(move || {
                    for _ in 0..100 {
                        stats.image_finished(Some(10));
                    }
                });
            }
        });

        let snapshot = stats.snapshot();
        assert_eq!(800, snapshot.images_done);
        assert_eq!(8000, snapshot.bytes);
    }

    #[test]
    fn tracks_album_progress() {
        let stats = RunStats::hidden();
        stats.album_started("Beach");
        stats.album_progress(1, 3);
        stats.image_finished(None);
        stats.album_finished(false);
        stats.album_retried();

        let snapshot = stats.snapshot();
        assert_eq!("Beach", snapshot.current_album);
        assert_eq!(33, snapshot.current_progress);
        assert_eq!(1, snapshot.images_failed);
        assert_eq!(0, snapshot.albums_failed);
    }

    #[test]
    fn elapsed_format() {
        let duration = chrono::Duration::hours(3)
            + chrono::Duration::minutes(3)
            + chrono::Duration::seconds(13);
        assert_eq!("3+03:13", Elapsed(duration).to_string());
    }
}
