//! Outbound notification seam.
//!
//! The auth core never renders or sends email itself; it hands
//! `(account, event, payload)` to a [`Notifier`] and moves on. Dispatch is
//! spawned onto the runtime by [`dispatch`], so a slow or failing notifier
//! can never block or fail an authentication flow.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Account-lifecycle events that trigger a notification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Welcome,
    VerifyEmail,
    AccountLocked,
    NewDeviceLogin,
    PasswordChanged,
    PasswordReset,
}

impl Event {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::VerifyEmail => "verify_email",
            Self::AccountLocked => "account_locked",
            Self::NewDeviceLogin => "new_device_login",
            Self::PasswordChanged => "password_changed",
            Self::PasswordReset => "password_reset",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Notification {
    pub account_id: Uuid,
    pub email: String,
    pub event: Event,
    pub payload: Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: Notification);
}

/// Default notifier: logs the event and drops it. Deployments plug in an
/// outbox or mailer behind the trait.
#[derive(Clone, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, notification: Notification) {
        info!(
            event = notification.event.as_str(),
            account_id = %notification.account_id,
            "notification dispatched"
        );
    }
}

/// Fire-and-forget dispatch on the current runtime.
pub(crate) fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    tokio::spawn(async move {
        notifier.send(notification).await;
    });
}
