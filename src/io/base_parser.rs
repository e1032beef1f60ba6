//! Worker pool behind every bulk parse.
//!
//! One enqueuer (the calling thread) walks the source and feeds the work
//! queue, `threads` workers extract values from each path, and one
//! consumer hands results to the sink. Shutdown is two-phase: workers are
//! told to stop only once every path has been queued and they drain the
//! queue before exiting, then the consumer drains the results.

use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use super::ParseError;

/// How long an idle worker waits before re-checking its stop flag
pub const QUEUE_POLL: Duration = Duration::from_secs(1);

/// Counters for one bulk run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseSummary {
    /// Files found under the source
    pub queued: usize,
    /// Files whose values reached the sink
    pub parsed: usize,
    /// Files that could not be read or extracted
    pub failed: usize,
}

/// Parse every file at or under `src` with `threads` workers.
///
/// `extract` runs on the workers; a file it rejects (or panics on) is
/// counted in [`ParseSummary::failed`] and the run carries on. `sink` runs
/// on a single consumer thread, in no particular order.
pub fn parse_dir<T, X, E, S>(
    src: &Path,
    threads: usize,
    extract: E,
    sink: S,
) -> Result<ParseSummary, ParseError>
where
    T: Send,
    X: Display,
    E: Fn(&Path) -> Result<T, X> + Sync,
    S: FnMut(T) + Send,
{
    if threads == 0 {
        return Err(ParseError::InvalidThreadCount(threads));
    }
    if !src.exists() {
        return Err(ParseError::SourceNotFound(src.to_path_buf()));
    }

    let (work_tx, work_rx) = crossbeam_channel::unbounded::<PathBuf>();
    let (result_tx, result_rx) = crossbeam_channel::unbounded::<T>();
    let stop_working = AtomicBool::new(false);
    let stop_consuming = AtomicBool::new(false);
    let parsed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let queued = thread::scope(|scope| {
        let consumer = scope.spawn(|| consume(&result_rx, &stop_consuming, sink));

        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let (extract, stop, parsed, failed) = (&extract, &stop_working, &parsed, &failed);
                scope.spawn(move || work(&work_rx, &result_tx, stop, extract, parsed, failed))
            })
            .collect();
        drop(result_tx);

        let queued = enqueue_files(src, &work_tx);
        drop(work_tx);

        stop_working.store(true, Ordering::SeqCst);
        for worker in workers {
            if worker.join().is_err() {
                error!("Parser worker panicked");
            }
        }
        stop_consuming.store(true, Ordering::SeqCst);
        if consumer.join().is_err() {
            error!("Parser consumer panicked");
        }
        queued
    });

    let summary = ParseSummary {
        queued,
        parsed: parsed.into_inner(),
        failed: failed.into_inner(),
    };
    info!(
        queued = summary.queued,
        parsed = summary.parsed,
        failed = summary.failed,
        "Parsed {}",
        src.display()
    );
    Ok(summary)
}

fn enqueue_files(src: &Path, queue: &Sender<PathBuf>) -> usize {
    WalkDir::new(src)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| queue.send(entry.path().to_path_buf()).is_ok())
        .count()
}

fn work<T, X, E>(
    queue: &Receiver<PathBuf>,
    results: &Sender<T>,
    stop: &AtomicBool,
    extract: &E,
    parsed: &AtomicUsize,
    failed: &AtomicUsize,
) where
    X: Display,
    E: Fn(&Path) -> Result<T, X>,
{
    loop {
        let path = match queue.recv_timeout(QUEUE_POLL) {
            Ok(path) => path,
            Err(RecvTimeoutError::Timeout) if stop.load(Ordering::SeqCst) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match catch_unwind(AssertUnwindSafe(|| extract(&path))) {
            Ok(Ok(value)) => {
                if results.send(value).is_err() {
                    break;
                }
                parsed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                debug!(path = %path.display(), "Skipping file: {}", e);
                failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                debug!(path = %path.display(), "Skipping file: extraction panicked");
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn consume<T, S>(queue: &Receiver<T>, stop: &AtomicBool, mut sink: S)
where
    S: FnMut(T),
{
    loop {
        match queue.recv_timeout(QUEUE_POLL) {
            Ok(value) => {
                if catch_unwind(AssertUnwindSafe(|| sink(value))).is_err() {
                    error!("Result sink panicked, continuing");
                }
            }
            Err(RecvTimeoutError::Timeout) if stop.load(Ordering::SeqCst) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
