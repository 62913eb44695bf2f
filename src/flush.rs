//! The flush lock: a single fair async mutex held by the worker while it
//! processes a chunk, and contended for by the vacuum path and by
//! cooperative shutdown.

use std::sync::Arc;

use tokio::sync::Mutex;

/// Cloned into the worker and into `vacuum::run`; nothing else touches
/// it.
#[derive(Clone, Default)]
pub struct FlushLock(Arc<Mutex<()>>);

impl FlushLock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(())))
    }

    pub(crate) fn inner(&self) -> &Mutex<()> {
        &self.0
    }
}
