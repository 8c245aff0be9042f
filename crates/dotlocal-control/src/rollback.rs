//! Ordered undo actions for a multi-step operation

use crate::collaborators::BoxError;
use crate::error::StepFailure;
use futures::future::BoxFuture;
use std::future::Future;
use tracing::{debug, warn};

type Undo = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Undo actions accumulated as each step succeeds
///
/// On failure, [`rollback`](Self::rollback) runs them newest first. Once every
/// step has succeeded, [`commit`](Self::commit) discards them.
#[derive(Default)]
pub struct Compensations {
    steps: Vec<(&'static str, Undo)>,
}

impl Compensations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how to undo a step that just succeeded
    pub fn push<F, Fut>(&mut self, step: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.steps.push((step, Box::new(move || Box::pin(undo()))));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn commit(self) {
        debug!("Committing {} step(s)", self.steps.len());
    }

    /// Run every undo action in reverse order
    ///
    /// A failing action does not stop the remaining ones; failures are returned.
    pub async fn rollback(self) -> Vec<StepFailure> {
        let mut failures = Vec::new();

        for (step, undo) in self.steps.into_iter().rev() {
            debug!("Rolling back: {}", step);
            if let Err(e) = undo().await {
                warn!("Rollback step '{}' failed: {}", step, e);
                failures.push(StepFailure::new(step, e));
            }
        }

        failures
    }
}
