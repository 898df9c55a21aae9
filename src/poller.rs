//! A background poller thread that periodically syncs the datafile.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{datafile_manager::DatafileManager, Error, Result};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between datafile syncs.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between syncs. This helps to avoid multiple
    /// server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
    /// Default value for [`PollerThreadConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(30);

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A datafile poller thread.
///
/// Use [`Client::start_poller_thread`](crate::Client::start_poller_thread) to get an instance of
/// it.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    result: Arc<PollerResult>,
}

/// Outcome of the first datafile sync, shared between the poller thread and its waiters.
///
/// Holds `None` if the datafile hasn't been synced yet. Holds `Some(Ok(()))` if it has been
/// synced successfully. Holds `Some(Err(...))` if there was a fatal error or the thread exited
/// before the first sync.
#[derive(Default)]
pub(crate) struct PollerResult {
    value: Mutex<Option<Result<()>>>,
    condvar: Condvar,
}

impl PollerResult {
    fn set(&self, value: Result<()>) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.condvar.notify_all();
    }

    /// Record `value` unless a result is already present.
    fn set_terminal(&self, value: Result<()>) {
        let mut lock = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        if lock.is_none() {
            *lock = Some(value);
        }
        self.condvar.notify_all();
    }

    /// Block until a result is present.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut lock = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .condvar
                        .wait(lock)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

impl PollerThread {
    /// Starts the poller thread with the provided configuration.
    ///
    /// # Errors
    ///
    /// - IO Error if poller thread failed to start.
    pub fn start(
        manager: Arc<DatafileManager>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 is enough as we're only sending a stop command, and we can
        // simply `try_send()` and ignore if the buffer is full.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new(PollerResult::default());

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);

            std::thread::Builder::new()
                .name("splitkit-poller".to_owned())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        log::debug!(target: "splitkit", "syncing datafile");
                        match manager.sync() {
                            Ok(outcome) => {
                                log::trace!(target: "splitkit",
                                            outcome:debug = outcome;
                                            "datafile sync finished");
                                result.set(Ok(()));
                            }
                            Err(err @ (Error::Unauthorized | Error::InvalidBaseUrl(_))) => {
                                // Unrecoverable errors
                                log::error!(target: "splitkit",
                                            err:display = err;
                                            "stopping datafile poller");
                                result.set(Err(err));
                                return;
                            }
                            Err(_) => {
                                // Other errors are retriable and already logged.
                            }
                        }

                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop back to sync again.
                            }
                            Ok(()) => {
                                log::debug!(target: "splitkit", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                log::debug!(target: "splitkit", "poller thread received disconnected");
                                return;
                            }
                        }
                    }));

                    // If catch_unwind returns Err, it means a panic occurred.
                    if outcome.is_err() {
                        result.set(Err(Error::PollerThreadPanicked));
                    } else {
                        // Release waiters if the thread stopped before the first sync.
                        result.set_terminal(Err(Error::PollerThreadStopped));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Waits for the first successful datafile sync.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`]
    /// - [`Error::PollerThreadStopped`] if the poller was stopped before the first sync.
    /// - [`Error::Unauthorized`]
    pub fn wait_for_configuration(&self) -> Result<()> {
        self.result.wait()
    }

    /// Shared handle to the first-sync result, so callers can wait without holding on to the
    /// poller itself.
    pub(crate) fn result(&self) -> Arc<PollerResult> {
        Arc::clone(&self.result)
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full. Either way the thread is stopped or stopping.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
