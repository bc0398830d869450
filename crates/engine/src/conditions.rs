//! Run-conditions gating dispatch.

use tokio::sync::watch;

/// An environmental gate on task dispatch, e.g. network availability or
/// battery level.
///
/// The engine polls [`are_met`](Conditions::are_met) before every
/// dispatch and watches the subscription for changes: a `false` edge
/// interrupts in-flight work, a `true` edge redispatches eligible tasks.
/// Duplicate and spurious edges are tolerated.
pub trait Conditions: Send + Sync + 'static {
    /// Current verdict. Must be cheap and side-effect free.
    fn are_met(&self) -> bool;

    /// A watch on the verdict. The engine only reacts to changes observed
    /// here, so providers must publish every transition they report.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Conditions that are always met. The default when a queue has no
/// environmental requirements.
#[derive(Debug)]
pub struct AlwaysMet {
    tx: watch::Sender<bool>,
}

impl AlwaysMet {
    /// Create the no-op conditions provider.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(true);
        Self { tx }
    }
}

impl Default for AlwaysMet {
    fn default() -> Self {
        Self::new()
    }
}

impl Conditions for AlwaysMet {
    fn are_met(&self) -> bool {
        true
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Conditions toggled by the caller. Useful as a bridge from platform
/// callbacks and throughout the test suite.
#[derive(Debug)]
pub struct ManualConditions {
    tx: watch::Sender<bool>,
}

impl ManualConditions {
    /// Create a provider with the given initial verdict.
    pub fn new(met: bool) -> Self {
        let (tx, _rx) = watch::channel(met);
        Self { tx }
    }

    /// Publish a new verdict. Re-publishing the current value is allowed.
    pub fn set(&self, met: bool) {
        self.tx.send_replace(met);
    }
}

impl Conditions for ManualConditions {
    fn are_met(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
