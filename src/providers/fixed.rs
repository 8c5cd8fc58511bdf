//! Deterministic providers for tests, demos and local runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::tier::{TierProvider, TierRequest, TierResult};

/// Returns the same result (or the same error) for every subject.
pub struct StaticProvider {
    name: String,
    result: TierResult,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticProvider {
    pub fn new(name: impl Into<String>, result: TierResult) -> Self {
        Self {
            name: name.into(),
            result,
            failure: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails at the transport level.
    pub fn failing(name: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut p = Self::new(name, TierResult::NotFound { cost: Default::default() });
        p.failure = Some(detail.into());
        p
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TierProvider for StaticProvider {
    async fn invoke(&self, _req: TierRequest<'_>) -> Result<TierResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        match &self.failure {
            Some(detail) => Err(anyhow!("{}: {detail}", self.name)),
            None => Ok(self.result.clone()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Computes the result from the request, e.g. keyed by subject.
pub struct FnProvider<F> {
    name: String,
    f: F,
    calls: AtomicUsize,
}

impl<F> FnProvider<F>
where
    F: Fn(TierRequest<'_>) -> Result<TierResult> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> TierProvider for FnProvider<F>
where
    F: Fn(TierRequest<'_>) -> Result<TierResult> + Send + Sync,
{
    async fn invoke(&self, req: TierRequest<'_>) -> Result<TierResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // yield so concurrent batches actually interleave
        tokio::task::yield_now().await;
        (self.f)(req)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Cost;
    use crate::subject::Subject;

    #[tokio::test]
    async fn fn_provider_sees_subject_key() {
        let p = FnProvider::new("echo", |req: TierRequest<'_>| {
            Ok(TierResult::Error {
                cost: Cost::ZERO,
                detail: req.key.to_string(),
            })
        });
        let s = Subject::with_domain("Acme.com");
        let key = s.key().unwrap();
        let out = p
            .invoke(TierRequest {
                subject: &s,
                key: &key,
                hint: None,
            })
            .await
            .unwrap();
        assert_eq!(
            out,
            TierResult::Error {
                cost: Cost::ZERO,
                detail: "domain:acme.com".into()
            }
        );
        assert_eq!(p.calls(), 1);
    }

    #[tokio::test]
    async fn failing_provider_errors_and_counts() {
        let p = StaticProvider::failing("down", "503 service unavailable");
        let s = Subject::with_domain("acme.com");
        let key = s.key().unwrap();
        let req = TierRequest {
            subject: &s,
            key: &key,
            hint: None,
        };
        assert!(p.invoke(req).await.is_err());
        assert_eq!(p.calls(), 1);
    }
}
