//! The process-wide deposit gate.
//!
//! At most one deposit may be uploading, verifying or publishing at a time.
//! Holding the permit is holding the gate; dropping it releases the gate on
//! every exit path.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type DepositPermit = OwnedMutexGuard<()>;

static GLOBAL_GATE: LazyLock<DepositGate> = LazyLock::new(DepositGate::new);

#[derive(Clone, Debug, Default)]
pub struct DepositGate {
    inner: Arc<Mutex<()>>,
}

impl DepositGate {
    /// A private gate, independent of [`DepositGate::global`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Self {
        GLOBAL_GATE.clone()
    }

    /// Wait up to `timeout` for the gate. `None` means it stayed taken.
    pub async fn acquire(&self, timeout: Duration) -> Option<DepositPermit> {
        tokio::time::timeout(timeout, self.inner.clone().lock_owned())
            .await
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out_until_release() {
        let gate = DepositGate::new();
        let permit = gate.acquire(Duration::from_millis(10)).await;
        assert!(permit.is_some());
        assert!(gate.acquire(Duration::from_millis(20)).await.is_none());

        drop(permit);
        assert!(gate.acquire(Duration::from_millis(20)).await.is_some());
    }

    #[tokio::test]
    async fn global_gate_is_shared() {
        let a = DepositGate::global();
        let b = DepositGate::global();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
        assert!(!Arc::ptr_eq(&a.inner, &DepositGate::new().inner));
    }
}
