// src/progress.rs

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::DownloadProgress;

/// Receives progress samples from an engine run.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Bytes written per chunk. Each chunk writes only its own slot; the sampler
/// sums all slots under one read lock so it never sees a half-updated set.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    slots: RwLock<Vec<u64>>,
}

impl ProgressBoard {
    pub fn new(chunks: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: RwLock::new(vec![0; chunks]),
        })
    }

    /// Handle through which chunk `index` reports its bytes.
    pub fn counter(self: &Arc<Self>, index: usize) -> ChunkCounter {
        ChunkCounter {
            board: Arc::clone(self),
            index,
        }
    }

    pub fn total(&self) -> u64 {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        slots.iter().sum()
    }

    fn update(&self, index: usize, f: impl FnOnce(&mut u64)) {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(index) {
            f(slot);
        }
    }
}

/// Write side of one board slot, owned by a single chunk fetch.
#[derive(Debug, Clone)]
pub struct ChunkCounter {
    board: Arc<ProgressBoard>,
    index: usize,
}

impl ChunkCounter {
    pub fn add(&self, bytes: u64) {
        self.board.update(self.index, |slot| *slot += bytes);
    }

    /// Resets the slot, e.g. when a retry truncates the part-file.
    pub fn set(&self, bytes: u64) {
        self.board.update(self.index, |slot| *slot = bytes);
    }
}

/// Turns raw byte counts into progress events.
///
/// Reported `downloaded` never decreases, even if a chunk retry throws bytes
/// away. Speed is the delta since the previous sample, not a lifetime average.
pub struct ProgressReporter {
    total: u64,
    callback: ProgressCallback,
    last_downloaded: u64,
    last_sample: Instant,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(total: u64, initial: u64, interval: Duration, callback: ProgressCallback) -> Self {
        Self {
            total,
            callback,
            last_downloaded: initial,
            last_sample: Instant::now(),
            interval,
        }
    }

    /// Emits a sample unconditionally.
    pub fn sample(&mut self, downloaded: u64) {
        let now = Instant::now();
        let downloaded = downloaded.max(self.last_downloaded);
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();
        let delta = downloaded - self.last_downloaded;
        let speed = if elapsed > 0.0 {
            (delta as f64 / elapsed) as u64
        } else {
            0
        };

        self.last_downloaded = downloaded;
        self.last_sample = now;
        (self.callback)(DownloadProgress {
            downloaded,
            total: self.total,
            speed,
        });
    }

    /// Emits a sample only if at least one interval has passed since the last one.
    pub fn maybe_sample(&mut self, downloaded: u64) {
        if self.last_sample.elapsed() >= self.interval {
            self.sample(downloaded);
        }
    }

    /// The closing event. `total` is pinned to the final byte count so that
    /// the last event always reads `downloaded == total`.
    pub fn finish(&mut self, downloaded: u64) {
        let downloaded = downloaded.max(self.last_downloaded);
        self.total = downloaded;
        self.sample(downloaded);
    }
}

/// Samples `board` every interval until `stop` fires, then hands the
/// reporter back so the caller can emit the closing event through it.
pub fn spawn_sampler(
    board: Arc<ProgressBoard>,
    mut reporter: ProgressReporter,
    stop: CancellationToken,
) -> JoinHandle<ProgressReporter> {
    tokio::spawn(async move {
        let period = reporter.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => reporter.sample(board.total()),
            }
        }
        reporter
    })
}

/// Format download speed in human-readable form.
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{} B/s", bytes_per_sec.round() as u64)
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    }
}
