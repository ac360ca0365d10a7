//! In-flight call records and completion queues.

use crate::error::ClientError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the completion queue created when the caller supplies none.
pub const DEFAULT_COMPLETION_CAPACITY: usize = 10;

/// Sending side of a completion queue.
pub type CompletionSender<A, R> = mpsc::Sender<Call<A, R>>;

/// Receiving side of a completion queue. Yields each call once it completes.
pub type Done<A, R> = mpsc::Receiver<Call<A, R>>;

/// Creates a bounded completion queue.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn completion_queue<A, R>(capacity: usize) -> (CompletionSender<A, R>, Done<A, R>) {
    assert!(
        capacity > 0,
        "rpcmux client: completion queue must have non-zero capacity"
    );
    mpsc::channel(capacity)
}

/// One remote call.
///
/// Owned by the client until it completes, then handed to whoever reads the
/// completion queue.
#[derive(Debug)]
pub struct Call<A, R> {
    /// Sequence number assigned at registration; 0 if never registered.
    pub seq: u64,
    /// Target method in `Service.Method` form.
    pub service_method: String,
    pub args: A,
    /// Reply value. Overwritten only when the call succeeds.
    pub reply: R,
    /// Set when the call failed.
    pub error: Option<ClientError>,
}

impl<A, R> Call<A, R> {
    pub(crate) fn new(service_method: impl Into<String>, args: A, reply: R) -> Self {
        Self {
            seq: 0,
            service_method: service_method.into(),
            args,
            reply,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Converts the completed call into its reply or error.
    pub fn into_result(self) -> Result<R, ClientError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.reply),
        }
    }
}

/// Pushes a completed call onto its queue.
///
/// Never blocks the caller. When the queue is full the push is handed to a
/// task that waits for room, so a slow reader delays only its own calls and
/// no completion is lost.
pub(crate) fn deliver<A, R>(done: &CompletionSender<A, R>, call: Call<A, R>)
where
    A: Send + 'static,
    R: Send + 'static,
{
    match done.try_send(call) {
        Ok(()) => {}
        Err(TrySendError::Full(call)) => {
            tracing::debug!(
                "Completion queue full, deferring {} (seq={})",
                call.service_method,
                call.seq
            );
            let done = done.clone();
            tokio::spawn(async move {
                if let Err(err) = done.send(call).await {
                    tracing::debug!(
                        "Completion queue closed, discarding {} (seq={})",
                        err.0.service_method,
                        err.0.seq
                    );
                }
            });
        }
        Err(TrySendError::Closed(call)) => {
            tracing::debug!(
                "Completion queue closed, discarding {} (seq={})",
                call.service_method,
                call.seq
            );
        }
    }
}
