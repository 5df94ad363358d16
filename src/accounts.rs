//! Account startup and lifecycle.
//!
//! Each configured account is validated, bound to its webhook path, and given
//! a cancellation token. A misconfigured account fails alone; the rest keep
//! running.

use crate::channels::{ChannelStatus, InstagramChannel};
use crate::config::AccountConfig;
use crate::gateway::registry::{RegistrationHandle, TargetRegistry, WebhookTarget};
use anyhow::{bail, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default webhook path for an account without an explicit override.
pub fn default_webhook_path(account_id: &str) -> String {
    format!("/webhook/instagram/{account_id}")
}

/// A running account registration. Dropping the handle does not unregister;
/// call [`AccountHandle::stop`] or cancel the token.
pub struct AccountHandle {
    pub account_id: String,
    pub path: String,
    pub status: Arc<ChannelStatus>,
    registration: Arc<RegistrationHandle>,
    cancel: CancellationToken,
}

impl AccountHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
        self.registration.unregister();
    }
}

/// Validate one account and register its webhook target.
pub fn start_account(
    registry: &Arc<TargetRegistry>,
    account: &AccountConfig,
) -> Result<AccountHandle> {
    if account.account_id.trim().is_empty() {
        bail!("account is missing an account_id");
    }

    let account_id = account.account_id.clone();
    let Some(access_token) = account
        .access_token
        .clone()
        .filter(|t| !t.trim().is_empty())
    else {
        bail!("account '{account_id}' is missing access_token");
    };
    let Some(page_id) = account.page_id.clone().filter(|p| !p.trim().is_empty()) else {
        bail!("account '{account_id}' is missing page_id");
    };
    let Some(verify_token) = account
        .verify_token
        .clone()
        .filter(|t| !t.trim().is_empty())
    else {
        bail!("account '{account_id}' is missing verify_token");
    };

    if account.app_secret.is_none() {
        tracing::warn!(
            account = %account_id,
            "no app_secret configured; webhook signatures will not be verified"
        );
    }

    let path = account
        .webhook_path
        .clone()
        .unwrap_or_else(|| default_webhook_path(&account_id));

    let status = Arc::new(ChannelStatus::new());
    let target = Arc::new(WebhookTarget {
        account_id: account_id.clone(),
        verify_token,
        app_secret: account.app_secret.clone(),
        channel: InstagramChannel::from_account(account, access_token, page_id),
        status: Arc::clone(&status),
    });

    let registration = Arc::new(registry.register(path.clone(), target));
    let cancel = CancellationToken::new();

    // Unregister when the token fires, so shutdown paths that only hold the
    // token still detach the account.
    {
        let registration = Arc::clone(&registration);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            registration.unregister();
        });
    }

    Ok(AccountHandle {
        account_id,
        path,
        status,
        registration,
        cancel,
    })
}

/// Start every configured account. Failures are logged per account and do not
/// stop the others.
pub fn start_accounts(
    registry: &Arc<TargetRegistry>,
    accounts: &[AccountConfig],
) -> Vec<AccountHandle> {
    let mut handles = Vec::new();
    for account in accounts {
        match start_account(registry, account) {
            Ok(handle) => {
                tracing::info!(
                    account = %handle.account_id,
                    path = %handle.path,
                    "account started"
                );
                handles.push(handle);
            }
            Err(e) => {
                tracing::error!("failed to start account '{}': {e}", account.account_id);
            }
        }
    }
    handles
}
