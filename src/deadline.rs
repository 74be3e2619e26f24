use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeadlineError {
    #[error("Deadline of {0:?} exceeded")]
    Exceeded(Duration),
    #[error("Guarded operation ended without a result")]
    Aborted,
}

/// Cooperative cancellation flag handed to guarded operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Bounds the wall-clock time of a single call.
///
/// Each guard owns its own timer, so any number of guards can run
/// concurrently. On expiry the caller gets [`DeadlineError::Exceeded`]
/// straight away; the operation's token is cancelled and whatever it
/// returns later is dropped.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineGuard {
    deadline: Duration,
}

impl DeadlineGuard {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn from_secs_f64(seconds: f64) -> Self {
        Self::new(Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX))
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run `op` on a worker thread and wait at most the deadline for it.
    pub fn run<T, F>(&self, op: F) -> Result<T, DeadlineError>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
        T: Send + 'static,
    {
        let token = CancelToken::new();
        let worker_token = token.clone();
        let (tx, rx) = mpsc::sync_channel(1);

        let handle = thread::spawn(move || {
            // The receiver is gone once the deadline has passed.
            let _ = tx.send(op(worker_token));
        });

        match rx.recv_timeout(self.deadline) {
            Ok(value) => {
                let _ = handle.join();
                Ok(value)
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                token.cancel();
                log::warn!("Operation exceeded deadline of {:?}", self.deadline);
                Err(DeadlineError::Exceeded(self.deadline))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => match handle.join() {
                Err(panic) => std::panic::resume_unwind(panic),
                Ok(()) => Err(DeadlineError::Aborted),
            },
        }
    }

    /// Async flavour; the future is dropped when the deadline fires.
    pub async fn run_async<F>(&self, fut: F) -> Result<F::Output, DeadlineError>
    where
        F: Future,
    {
        tokio::time::timeout(self.deadline, fut).await.map_err(|_| {
            log::warn!("Operation exceeded deadline of {:?}", self.deadline);
            DeadlineError::Exceeded(self.deadline)
        })
    }
}
