//! Idempotency oracle: "is the expected result for this period already done?"
//!
//! The scheduler consults the oracle before enqueuing recurring, triggered or
//! backfill work. Implementations are backed by whatever persistence owns the
//! produced results.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;

use super::schedule::{Period, ScheduleTarget};
use crate::error::Result;

#[async_trait]
pub trait IdempotencyOracle: Send + Sync {
    /// `Ok(true)` when the target's work for `period` already exists.
    async fn is_complete(&self, target: &ScheduleTarget, period: &Period) -> Result<bool>;
}

/// Reports every period as incomplete.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverComplete;

#[async_trait]
impl IdempotencyOracle for NeverComplete {
    async fn is_complete(&self, _target: &ScheduleTarget, _period: &Period) -> Result<bool> {
        Ok(false)
    }
}

/// Oracle backed by an async closure over owned copies of its arguments.
pub struct FnOracle<F> {
    func: F,
}

impl<F, Fut> FnOracle<F>
where
    F: Fn(ScheduleTarget, Period) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> IdempotencyOracle for FnOracle<F>
where
    F: Fn(ScheduleTarget, Period) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    async fn is_complete(&self, target: &ScheduleTarget, period: &Period) -> Result<bool> {
        (self.func)(target.clone(), *period).await
    }
}

/// In-process set of completed dedupe keys. Useful for single-process
/// deployments and tests; handlers call [`InMemoryOracle::mark_complete`].
#[derive(Debug, Default)]
pub struct InMemoryOracle {
    completed: RwLock<HashSet<String>>,
}

impl InMemoryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_complete(&self, target: &ScheduleTarget, period: &Period) {
        self.completed.write().insert(target.dedupe_key(period));
    }

    /// Mark by raw dedupe key, e.g. one carried in a job payload.
    pub fn mark_key_complete(&self, key: impl Into<String>) {
        self.completed.write().insert(key.into());
    }

    pub fn len(&self) -> usize {
        self.completed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.read().is_empty()
    }
}

#[async_trait]
impl IdempotencyOracle for InMemoryOracle {
    async fn is_complete(&self, target: &ScheduleTarget, period: &Period) -> Result<bool> {
        Ok(self.completed.read().contains(&target.dedupe_key(period)))
    }
}
