//! Shared LLM client limits
//!
//! The LLM client is shared across every concurrently running job. Two limits
//! apply: a global permit pool and a per-tenant concurrency ceiling, so a
//! single tenant's bulk import cannot starve everyone else. Excess callers
//! wait; they do not fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default global concurrent LLM calls
pub const DEFAULT_GLOBAL_LIMIT: usize = 8;
/// Default concurrent LLM calls per tenant
pub const DEFAULT_TENANT_LIMIT: usize = 2;

/// Concurrency limiter for the shared LLM client
pub struct LlmLimiter {
    global: Arc<Semaphore>,
    tenant_limit: usize,
    per_tenant: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Both permits held for the duration of one call
pub struct LlmPermit {
    _global: OwnedSemaphorePermit,
    _tenant: OwnedSemaphorePermit,
}

impl Default for LlmLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_GLOBAL_LIMIT, DEFAULT_TENANT_LIMIT)
    }
}

impl LlmLimiter {
    pub fn new(global_limit: usize, tenant_limit: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_limit.max(1))),
            tenant_limit: tenant_limit.max(1),
            per_tenant: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for a slot under both the tenant ceiling and the global pool.
    ///
    /// Tenant first, then global, so a tenant at its ceiling does not park
    /// inside the global pool while waiting.
    pub async fn acquire(&self, tenant_id: &str) -> LlmPermit {
        let tenant_sem = {
            let mut map = self.per_tenant.lock().unwrap();
            map.entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.tenant_limit)))
                .clone()
        };

        // Semaphores are never closed, so acquire cannot fail
        let tenant = tenant_sem.acquire_owned().await.expect("semaphore closed");
        let global = self.global.clone().acquire_owned().await.expect("semaphore closed");
        LlmPermit {
            _global: global,
            _tenant: tenant,
        }
    }
}

/// Exponential backoff with jitter for retrying transient LLM failures.
///
/// Base 500ms doubling per attempt, capped at 8s. The jitter source is the
/// subsecond clock; it only needs to decorrelate concurrent retries.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 500u64.saturating_mul(1u64 << attempt.min(4));
    let jitter_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % 250)
        .unwrap_or(0);
    Duration::from_millis(base_ms.min(8_000) + jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_tenant_ceiling() {
        let limiter = Arc::new(LlmLimiter::new(8, 1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire("acme").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // Ceiling of 1: never more than one call in flight for the tenant
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tenants_do_not_block_each_other() {
        let limiter = Arc::new(LlmLimiter::new(8, 1));
        let _a = limiter.acquire("acme").await;
        // A second tenant gets a permit immediately even while acme holds its
        // ceiling
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire("globex"))
            .await
            .expect("globex should not wait on acme's ceiling");
    }

    #[test]
    fn test_backoff_growth() {
        assert!(backoff_delay(0) < backoff_delay(2));
        assert!(backoff_delay(10) <= Duration::from_millis(8_250));
    }
}
