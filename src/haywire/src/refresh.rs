//! Background beacon refresh

use crate::error::Result;
use crate::reader::BeaconReader;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(2);

/// Calls [`BeaconReader::refresh`] on a named thread until dropped
pub struct BackgroundRefresher {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    cycles: Arc<AtomicU64>,
}

impl BackgroundRefresher {
    pub fn start(reader: Arc<BeaconReader>) -> Result<Self> {
        Self::with_interval(reader, DEFAULT_REFRESH_INTERVAL)
    }

    pub fn with_interval(reader: Arc<BeaconReader>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let cycles = Arc::new(AtomicU64::new(0));
        let counter = cycles.clone();

        let thread = thread::Builder::new()
            .name("haywire-refresh".into())
            .spawn(move || {
                debug!("Beacon refresher started ({:?})", interval);
                loop {
                    let ok = reader.refresh();
                    counter.fetch_add(1, Ordering::Relaxed);
                    trace!("Background refresh: {}", if ok { "ok" } else { "failed" });
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                debug!("Beacon refresher stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            cycles,
        })
    }

    /// Completed refresh passes
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

impl Drop for BackgroundRefresher {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::GuestImage;
    use std::time::Instant;

    #[test]
    fn test_refresher_picks_up_companion() {
        let mut image = GuestImage::new(1024);
        let backend = Arc::new(image.backend());
        let reader = Arc::new(BeaconReader::new(backend.clone()));
        let refresher = BackgroundRefresher::with_interval(reader.clone(), Duration::from_millis(10)).unwrap();

        let arena = image.place_arena(0, 0x99, true);
        image.publish_pids(&arena, 0, 1, &[1, 2, 3]);
        image.sync(&backend);

        let deadline = Instant::now() + Duration::from_secs(5);
        while reader.get_pid_list().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(reader.get_pid_list(), vec![1, 2, 3]);
        assert!(refresher.cycles() >= 1);
    }

    #[test]
    fn test_drop_stops_thread() {
        let reader = Arc::new(BeaconReader::new(Arc::new(GuestImage::new(4).backend())));
        let refresher = BackgroundRefresher::with_interval(reader.clone(), Duration::from_secs(60)).unwrap();
        let started = Instant::now();
        drop(refresher);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(Arc::strong_count(&reader), 1);
    }
}
