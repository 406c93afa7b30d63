//! Typed handler registry.
//!
//! Each job type maps to exactly one [`JobHandler`]. The registry is built once
//! at startup; duplicate registrations and missing required types are startup
//! errors rather than runtime surprises.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::job::{JobContext, JobResult, RetryPolicy};
use crate::error::{CoreError, ErrorCode, Result};

/// Executes jobs of one type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler serves.
    fn job_type(&self) -> &'static str;

    /// Run one attempt. Handlers must be idempotent: delivery is at-least-once.
    async fn handle(&self, ctx: &JobContext) -> JobResult;

    /// Override the queue's default retry policy for this job type.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    job_type: &'static str,
    func: F,
    retry_policy: Option<RetryPolicy>,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    pub fn new(job_type: &'static str, func: F) -> Self {
        Self {
            job_type,
            func,
            retry_policy: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult> + Send,
{
    fn job_type(&self) -> &'static str {
        self.job_type
    }

    async fn handle(&self, ctx: &JobContext) -> JobResult {
        (self.func)(ctx.clone()).await
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry_policy.clone()
    }
}

/// Immutable mapping from job type to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// A registry with no handlers.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// The handler's own retry policy for a job type, if it declares one.
    pub fn retry_policy_for(&self, job_type: &str) -> Option<RetryPolicy> {
        self.handlers.get(job_type).and_then(|h| h.retry_policy())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Fail unless every listed job type has a handler.
    pub fn ensure_registered<S: AsRef<str>>(&self, job_types: &[S]) -> Result<()> {
        let missing: Vec<&str> = job_types
            .iter()
            .map(AsRef::as_ref)
            .filter(|t| !self.contains(t))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        Err(CoreError::new(
            ErrorCode::HandlerNotRegistered,
            format!("No handler registered for job type(s): {}", missing.join(", ")),
        )
        .with_context("missing", &missing)
        .with_suggestion("Register a handler for each job type before starting the runtime"))
    }
}

/// Collects handlers and rejects duplicate job types on `build`.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: BTreeMap<&'static str, Arc<dyn JobHandler>>,
    duplicates: Vec<&'static str>,
}

impl HandlerRegistryBuilder {
    pub fn register<H: JobHandler + 'static>(self, handler: H) -> Self {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(mut self, handler: Arc<dyn JobHandler>) -> Self {
        let job_type = handler.job_type();
        if self.handlers.insert(job_type, handler).is_some() {
            self.duplicates.push(job_type);
        }
        self
    }

    pub fn build(self) -> Result<HandlerRegistry> {
        if !self.duplicates.is_empty() {
            return Err(CoreError::new(
                ErrorCode::DuplicateHandler,
                format!(
                    "Job type(s) registered more than once: {}",
                    self.duplicates.join(", ")
                ),
            ));
        }

        tracing::debug!(types = ?self.handlers.keys().collect::<Vec<_>>(), "Handler registry built");

        Ok(HandlerRegistry {
            handlers: self.handlers.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{Job, JobError, NewJob};
    use chrono::Utc;
    use serde_json::json;

    struct Noop(&'static str);

    #[async_trait]
    impl JobHandler for Noop {
        fn job_type(&self) -> &'static str {
            self.0
        }

        async fn handle(&self, _ctx: &JobContext) -> JobResult {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::builder()
            .register(Noop("generate"))
            .register(Noop("email"))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("generate").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.types(), vec!["email", "generate"]);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let err = HandlerRegistry::builder()
            .register(Noop("email"))
            .register(Noop("email"))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateHandler);
    }

    #[test]
    fn test_ensure_registered_lists_missing_types() {
        let registry = HandlerRegistry::builder()
            .register(Noop("generate"))
            .build()
            .unwrap();

        assert!(registry.ensure_registered(&["generate"]).is_ok());
        let err = registry
            .ensure_registered(&["generate", "email", "webhook"])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::HandlerNotRegistered);
        assert!(err.user_message().contains("email, webhook"));
    }

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = FnHandler::new("email", |ctx: JobContext| async move {
            match ctx.payload_str("to") {
                Some(_) => Ok(()),
                None => Err(JobError::fatal("missing recipient")),
            }
        })
        .with_retry_policy(RetryPolicy::no_retry());

        let ok = JobContext::new(Job::from_request(
            NewJob::new("email", json!({"to": "a@b.c"})),
            3,
            Utc::now(),
        ));
        let bad = JobContext::new(Job::from_request(NewJob::new("email", json!({})), 3, Utc::now()));

        assert!(handler.handle(&ok).await.is_ok());
        assert!(handler.handle(&bad).await.is_err());
        assert_eq!(handler.retry_policy().unwrap().max_attempts, 1);
    }
}
