//! Periodic background loops (cache expiry, heartbeat sweep).

use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};

use crate::error::{ExchangeError, ExchangeResult};

/// A named thread that runs `task` every `every` until stopped.
pub(crate) struct PeriodicTask {
    name: String,
    stop_tx: Sender<()>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask").field("name", &self.name).finish_non_exhaustive()
    }
}

impl PeriodicTask {
    pub(crate) fn spawn<F>(name: &str, every: Duration, mut task: F) -> ExchangeResult<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let every = every.max(Duration::from_millis(1));
        let join = thread::Builder::new()
            .name(format!("kyroql-exchange-{name}"))
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    default(every) => task(),
                }
            })
            .map_err(|e| ExchangeError::internal(format!("failed to spawn {name}: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            stop_tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// Stops the loop and joins the thread. Idempotent.
    pub(crate) fn stop(&self) {
        let handle = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = self.stop_tx.try_send(());
            if handle.join().is_err() {
                tracing::error!(task = %self.name, "background task panicked");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PeriodicTask::spawn("test-tick", Duration::from_millis(2), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        task.stop();
        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 3);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
        task.stop();
    }
}
