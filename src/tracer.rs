//! Counted completion barrier shared between an issuer and the consumers of its work

use log::{error, trace};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::TracerError;

#[derive(Debug)]
struct TracerInner {
    pending: watch::Sender<usize>,
    tags: BTreeMap<String, String>,
}

/// A counted barrier: the issuer `add`s the number of acknowledgements it
/// expects, consumers call `done` once each, and `wait` resolves when the
/// count returns to zero.
///
/// Cloning is cheap and every clone refers to the same counter. A tracer is
/// single-use: once `wait` has returned for a unit of work it is not re-armed.
#[derive(Debug, Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    /// Create a tracer with nothing pending and the given result tags
    pub fn new(tags: BTreeMap<String, String>) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(TracerInner { pending, tags }),
        }
    }

    /// Expect `n` more acknowledgements
    pub fn add(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.inner.pending.send_modify(|pending| *pending += n);
        trace!("Tracer incremented by {} (pending {})", n, self.pending());
    }

    /// Acknowledge one unit of work
    pub fn done(&self) -> Result<(), TracerError> {
        let mut outcome = Ok(());
        self.inner.pending.send_if_modified(|pending| {
            if *pending == 0 {
                outcome = Err(TracerError::Overreleased);
                false
            } else {
                *pending -= 1;
                true
            }
        });

        if outcome.is_err() {
            error!("Tracer released with nothing pending");
        }
        outcome
    }

    /// Wait until every expected acknowledgement has arrived.
    /// Returns immediately when nothing is pending.
    pub async fn wait(&self) {
        let mut rx = self.inner.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    /// Like `wait`, but gives up after `timeout`
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), TracerError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| TracerError::Timeout(timeout))
    }

    /// Number of acknowledgements still outstanding
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    /// Tags attached to every result produced under this tracer
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.inner.tags
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}
