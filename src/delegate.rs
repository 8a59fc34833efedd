//! Application delegates.
//!
//! Delegates are told about connections and adapter state transitions before
//! the matching event is published. They run one after another; a failing or
//! panicking delegate is logged and skipped.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::ble::native::AccessState;
use crate::error::Result;
use crate::peripheral::Peripheral;

/// Application hook for central lifecycle events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleDelegate: Send + Sync {
    /// A peripheral's link came up.
    async fn on_connected(&self, peripheral: Arc<Peripheral>) -> Result<()> {
        let _ = peripheral;
        Ok(())
    }

    /// The adapter moved to a new state.
    async fn on_adapter_state_changed(&self, state: AccessState) -> Result<()> {
        let _ = state;
        Ok(())
    }
}

/// Ordered set of delegates.
#[derive(Default, Clone)]
pub struct DelegateRegistry {
    delegates: Arc<RwLock<Vec<Arc<dyn BleDelegate>>>>,
}

impl DelegateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delegate. Delegates run in registration order.
    pub fn register(&self, delegate: Arc<dyn BleDelegate>) {
        self.delegates.write().push(delegate);
    }

    /// Number of registered delegates.
    pub fn len(&self) -> usize {
        self.delegates.read().len()
    }

    /// Whether no delegate is registered.
    pub fn is_empty(&self) -> bool {
        self.delegates.read().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<dyn BleDelegate>> {
        self.delegates.read().clone()
    }

    /// Run every delegate's `on_connected`.
    pub async fn notify_connected(&self, peripheral: &Arc<Peripheral>) {
        for delegate in self.snapshot() {
            let call = delegate.on_connected(peripheral.clone());
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Delegate failed on connect of {}: {}", peripheral.address(), e),
                Err(_) => error!("Delegate panicked on connect of {}", peripheral.address()),
            }
        }
    }

    /// Run every delegate's `on_adapter_state_changed`.
    pub async fn notify_adapter_state(&self, state: AccessState) {
        debug!("Adapter state changed to {}", state);
        for delegate in self.snapshot() {
            let call = delegate.on_adapter_state_changed(state);
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Delegate failed on adapter state {}: {}", state, e),
                Err(_) => error!("Delegate panicked on adapter state {}", state),
            }
        }
    }
}

impl std::fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("delegates", &self.len())
            .finish()
    }
}
