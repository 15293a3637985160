//! Single repeating background task
//!
//! `stopped <-> running`. Starting while running replaces the old task, so at
//! most one task is ever live. Stopping is immediate: the worker thread is
//! told to exit and is not joined, an in-flight tick runs to completion.

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

type Task = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub(crate) struct Scheduler {
    stop: Mutex<Option<Sender<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `period`, first one period from now.
    ///
    /// Cancels whatever was scheduled before.
    pub fn start(&self, period: Duration, task: Task) {
        let mut stop = self.stop.lock();
        // Dropping the old sender disconnects the old worker's receiver.
        stop.take();

        let (sender, receiver) = channel::bounded::<()>(1);
        let spawned = thread::Builder::new()
            .name("connection-monitor".to_string())
            .spawn(move || {
                loop {
                    match receiver.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            if panic::catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                                error!("scheduled inspection panicked");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            });

        match spawned {
            Ok(_) => {
                info!(?period, "scheduled inspection started");
                *stop = Some(sender);
            }
            Err(e) => error!(error = %e, "failed to start scheduled inspection"),
        }
    }

    /// Cancel the scheduled task, if any
    pub fn stop(&self) {
        if let Some(sender) = self.stop.lock().take() {
            let _ = sender.try_send(());
            info!("scheduled inspection stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
