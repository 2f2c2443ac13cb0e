//! Per-domain serialization.
//!
//! Two operations on the same domain (say, two record changes on one zone) would otherwise
//! race on serial allocation and publish ordering. Every orchestrator entry point that touches
//! a domain holds that domain's lock for its whole duration. Operations on different domains
//! never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::OwnedMutexGuard;

/// Held for the duration of one domain operation.
#[derive(Debug)]
pub struct DomainGuard {
    domain: String,
    _guard: OwnedMutexGuard<()>,
}

impl DomainGuard {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// A lock per domain name. Only weak references are kept, so a domain's lock disappears once
/// nobody holds or waits for it.
#[derive(Debug, Default)]
pub struct DomainLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl DomainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, domain: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(domain).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(domain.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Wait for exclusive access to `domain`.
    pub async fn lock(&self, domain: &str) -> DomainGuard {
        let domain = domain.to_ascii_lowercase();
        let guard = self.entry(&domain).lock_owned().await;
        tracing::trace!("locked {domain}");
        DomainGuard {
            domain,
            _guard: guard,
        }
    }

    /// The number of domains currently locked or waited on.
    pub fn len(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|lock| lock.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
