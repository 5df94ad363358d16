//! Webhook target registry: maps webhook paths to the account bundles that
//! claimed them. Several accounts may share a path; delivery is attributed to
//! the first target whose signature check passes.

use crate::channels::{ChannelStatus, InstagramChannel};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything the webhook handler needs to verify and dispatch for one account.
pub struct WebhookTarget {
    pub account_id: String,
    /// Echoed back by Meta during GET verification.
    pub verify_token: String,
    /// `X-Hub-Signature-256` key. `None` disables signature checks for this
    /// target; such targets accept any body.
    pub app_secret: Option<String>,
    pub channel: InstagramChannel,
    pub status: Arc<ChannelStatus>,
}

#[derive(Default)]
pub struct TargetRegistry {
    targets: RwLock<HashMap<String, Vec<Arc<WebhookTarget>>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target under `path`. Registration order is preserved and
    /// decides verification precedence when paths are shared.
    pub fn register(
        self: &Arc<Self>,
        path: impl Into<String>,
        target: Arc<WebhookTarget>,
    ) -> RegistrationHandle {
        let path = path.into();
        self.targets
            .write()
            .entry(path.clone())
            .or_default()
            .push(target.clone());
        tracing::info!(
            path = %path,
            account = %target.account_id,
            "registered webhook target"
        );
        RegistrationHandle {
            registry: Arc::clone(self),
            path,
            target,
            released: AtomicBool::new(false),
        }
    }

    /// All targets registered for `path`, in registration order.
    pub fn resolve(&self, path: &str) -> Vec<Arc<WebhookTarget>> {
        self.targets
            .read()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// All registrations as `(path, target)` pairs, for status reporting.
    pub fn snapshot(&self) -> Vec<(String, Arc<WebhookTarget>)> {
        let targets = self.targets.read();
        let mut all = Vec::new();
        for (path, list) in targets.iter() {
            for target in list {
                all.push((path.clone(), Arc::clone(target)));
            }
        }
        all
    }

    pub fn is_registered(&self, path: &str) -> bool {
        self.targets
            .read()
            .get(path)
            .is_some_and(|v| !v.is_empty())
    }

    fn unregister(&self, path: &str, target: &Arc<WebhookTarget>) {
        let mut targets = self.targets.write();
        if let Some(list) = targets.get_mut(path) {
            list.retain(|t| !Arc::ptr_eq(t, target));
            if list.is_empty() {
                targets.remove(path);
            }
        }
    }
}

/// Removes exactly the registration that produced it. Calling `unregister`
/// twice is a no-op; other targets on the same path are untouched.
pub struct RegistrationHandle {
    registry: Arc<TargetRegistry>,
    path: String,
    target: Arc<WebhookTarget>,
    released: AtomicBool,
}

impl RegistrationHandle {
    pub fn unregister(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.unregister(&self.path, &self.target);
        tracing::info!(
            path = %self.path,
            account = %self.target.account_id,
            "unregistered webhook target"
        );
    }
}
