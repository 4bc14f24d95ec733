//! Background worker that periodically asks the control thread to refresh
//! channel telemetry.
//!
//! The poller never touches instruments or sequencer state. It only sends a
//! "refresh requested" message; the refresh itself runs on the control thread.
//! At most one request is outstanding at a time so a busy control thread is
//! not flooded.

use anyhow::{anyhow, Result};
use flume::Sender;
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct PollerFlags {
    paused: bool,
    running: bool,
}

#[derive(Debug)]
struct PollerShared {
    flags: Mutex<PollerFlags>,
    wake: Condvar,
    pending: AtomicBool,
}

pub struct TelemetryPoller {
    shared: Arc<PollerShared>,
    handle: Option<JoinHandle<()>>,
}

impl TelemetryPoller {
    /// Spawn the worker. `message` is sent on `tx` every `interval` while running.
    pub fn spawn<T>(interval: Duration, tx: Sender<T>, message: T) -> Result<Self>
    where
        T: Clone + Send + 'static,
    {
        let shared = Arc::new(PollerShared {
            flags: Mutex::new(PollerFlags {
                paused: false,
                running: true,
            }),
            wake: Condvar::new(),
            pending: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("telemetry-poller".to_string())
            .spawn(move || run_poll_loop(worker_shared, interval, tx, message))
            .map_err(|err| anyhow!("Failed to spawn telemetry poller: {err}"))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn pause(&self) {
        self.shared.flags.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut flags = self.shared.flags.lock();
        flags.paused = false;
        self.shared.wake.notify_all();
    }

    /// Stop the worker, waking it if paused, and wait for it to exit.
    pub fn stop(&mut self) {
        {
            let mut flags = self.shared.flags.lock();
            flags.running = false;
            flags.paused = false;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Telemetry poller thread panicked");
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.flags.lock().paused
    }

    pub fn is_running(&self) -> bool {
        self.shared.flags.lock().running && self.handle.is_some()
    }

    /// Called by the consumer once a refresh request has been handled.
    pub fn mark_refresh_complete(&self) {
        self.shared.pending.store(false, Ordering::Release);
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_poll_loop<T: Clone>(
    shared: Arc<PollerShared>,
    interval: Duration,
    tx: Sender<T>,
    message: T,
) {
    log::debug!("Telemetry poller started ({interval:?} interval)");
    loop {
        {
            let mut flags = shared.flags.lock();
            while flags.paused && flags.running {
                shared.wake.wait(&mut flags);
            }
            if !flags.running {
                break;
            }
        }

        if shared
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && tx.send(message.clone()).is_err()
        {
            log::warn!("Telemetry consumer disconnected, stopping poller");
            break;
        }

        let mut flags = shared.flags.lock();
        if !flags.running {
            break;
        }
        let _ = shared.wake.wait_for(&mut flags, interval);
        if !flags.running {
            break;
        }
    }
    log::debug!("Telemetry poller stopped");
}
