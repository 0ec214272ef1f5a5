//! Deadlock watchdog
//!
//! Periodically asks parking_lot for lock cycles and logs every thread caught
//! in one. Only locks taken through parking_lot are visible to it.

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::deadlock;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

/// Background thread running deadlock checks until stopped or dropped
pub struct DeadlockWatchdog {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeadlockWatchdog {
    pub fn start(interval: Duration) -> std::io::Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name("deadlock-watchdog".to_string())
            .spawn(move || {
                info!("Deadlock watchdog checking every {:?}", interval);
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    check_now();
                }
                debug!("Deadlock watchdog stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // disconnecting the channel wakes the thread
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeadlockWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run one check, returning how many deadlock cycles were found
pub fn check_now() -> usize {
    let deadlocks = deadlock::check_deadlock();
    if deadlocks.is_empty() {
        return 0;
    }

    error!("{} deadlock(s) detected", deadlocks.len());
    for (i, threads) in deadlocks.iter().enumerate() {
        error!("Deadlock #{}", i);
        for thread in threads {
            error!(
                "Thread {:?}\n{:?}",
                thread.thread_id(),
                thread.backtrace()
            );
        }
    }
    deadlocks.len()
}
