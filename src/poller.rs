//! A generic background thread that runs a task periodically until stopped.
//!
//! Used for specs polling, id-list syncing and local file re-reads.
use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, SyncSender},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub(crate) struct PollerConfig {
    /// Interval to wait between runs.
    pub interval: Duration,
    /// Randomized duration subtracted from the interval, so multiple hosts don't synchronize.
    pub jitter: Duration,
    /// Upper bound for the wait after consecutive failures.
    pub max_backoff: Duration,
    /// Run the task once before the first wait.
    pub run_immediately: bool,
}

impl PollerConfig {
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

    pub fn new(interval: Duration) -> PollerConfig {
        PollerConfig {
            interval,
            jitter: interval / 10,
            max_backoff: PollerConfig::DEFAULT_MAX_BACKOFF,
            run_immediately: false,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> PollerConfig {
        self.jitter = jitter;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> PollerConfig {
        self.max_backoff = max_backoff;
        self
    }

    pub fn run_immediately(mut self, run_immediately: bool) -> PollerConfig {
        self.run_immediately = run_immediately;
        self
    }
}

/// Outcome of one poller task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// Keep polling at the regular interval.
    Continue,
    /// The run failed; wait with exponential backoff before retrying.
    Failed,
    /// Unrecoverable condition; exit the thread.
    Stop,
}

/// A running poller thread.
pub(crate) struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: SyncSender<()>,

    /// Receives a message once the thread has exited.
    done_receiver: Receiver<()>,
}

impl PollerThread {
    pub fn start<F>(name: &str, config: PollerConfig, mut task: F) -> Result<PollerThread>
    where
        F: FnMut() -> PollOutcome + Send + 'static,
    {
        // Buffer size of 1 is enough: we only ever `try_send()` a stop command, and a full buffer
        // means another thread has already asked to stop.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let (done_sender, done_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let thread_name = name.to_owned();
        let join_handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut failures: u32 = 0;
                    let mut run_now = config.run_immediately;
                    loop {
                        if run_now {
                            match task() {
                                PollOutcome::Continue => failures = 0,
                                PollOutcome::Failed => failures = failures.saturating_add(1),
                                PollOutcome::Stop => {
                                    log::debug!(target: "switchyard", thread = thread_name.as_str(); "poller task asked to stop");
                                    return;
                                }
                            }
                        }
                        run_now = true;

                        let timeout = if failures == 0 {
                            jitter(config.interval, config.jitter)
                        } else {
                            backoff(config.interval, failures, config.max_backoff)
                        };
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop back to run the task again.
                            }
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "switchyard", thread = thread_name.as_str(); "poller thread received stop command");
                                return;
                            }
                        }
                    }
                }));

                if result.is_err() {
                    log::error!(target: "switchyard", thread = thread_name.as_str(); "poller thread panicked");
                }
                let _ = done_sender.try_send(());
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
            done_receiver,
        })
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means the thread has exited or another stop command is pending. Either way the
        // thread will stop.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and wait up to `timeout` for it to exit.
    ///
    /// A thread stuck in a task past the timeout is detached.
    pub fn shutdown(self, timeout: Duration) -> Result<()> {
        self.stop();

        match self.done_receiver.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self
                .join_handle
                .join()
                .map_err(|_| Error::ThreadPanicked),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout {
                operation: "poller shutdown",
                timeout,
            }),
        }
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

/// Exponential backoff: `interval * 2^failures`, capped at `max`.
fn backoff(interval: Duration, failures: u32, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(max)
}
