use std::thread;

use crossbeam_channel::{bounded, unbounded};

use crate::cancel::CancelToken;

/// Runs `f` over `items` on `workers` threads and returns the results in
/// submission order.
///
/// Submission blocks while every worker is busy and the hand-off queue is
/// full. Once `cancel` fires no further item is started, so the result may be
/// shorter than the input.
pub fn map_bounded<T, R, F>(workers: usize, items: Vec<T>, cancel: &CancelToken, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let workers = workers.max(1).min(items.len().max(1));
    let (work_tx, work_rx) = bounded::<(usize, T)>(workers);
    let (done_tx, done_rx) = unbounded::<(usize, R)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let f = &f;
            scope.spawn(move || {
                for (idx, item) in work_rx.iter() {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if done_tx.send((idx, f(item))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(done_tx);

        for (idx, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() || work_tx.send((idx, item)).is_err() {
                break;
            }
        }
        drop(work_tx);
    });

    let mut results: Vec<_> = done_rx.into_iter().collect();
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, result)| result).collect()
}
