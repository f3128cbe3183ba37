//! Device tracking for login sessions.
//!
//! Devices are keyed by (account, fingerprint). The fingerprint is an
//! opaque client-supplied string; the tracker records first/last seen
//! timestamps plus the latest IP and user agent, and reports whether a
//! login came from a fingerprint the account has not used before.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::models::AuthDevice;
use crate::store::AuthStore;
use crate::util::now_unix;

pub struct DeviceTracker {
    store: Arc<dyn AuthStore>,
}

impl DeviceTracker {
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>) -> Self {
        Self { store }
    }

    /// Record a login from the given fingerprint. Returns the device row
    /// and true when the fingerprint was new for this account.
    pub async fn track(
        &self,
        account_id: Uuid,
        fingerprint: &str,
        ip_address: &str,
        user_agent: &str,
    ) -> Result<(AuthDevice, bool)> {
        let now = now_unix();
        let (device, is_new) = match self.store.find_device(account_id, fingerprint).await? {
            Some(mut device) => {
                device.last_ip = ip_address.to_string();
                device.last_user_agent = user_agent.to_string();
                device.last_seen = now;
                (device, false)
            }
            None => {
                let device = AuthDevice {
                    id: Uuid::new_v4(),
                    account_id,
                    fingerprint: fingerprint.to_string(),
                    device_name: device_name_from_user_agent(user_agent).to_string(),
                    last_ip: ip_address.to_string(),
                    last_user_agent: user_agent.to_string(),
                    first_seen: now,
                    last_seen: now,
                    trusted: false,
                };
                info!(account_id = %account_id, name = device.device_name, "new device seen");
                (device, true)
            }
        };
        self.store.upsert_device(&device).await?;
        Ok((device, is_new))
    }

    /// Devices for the account, most recently seen first.
    pub async fn list(&self, account_id: Uuid) -> Result<Vec<AuthDevice>> {
        self.store.list_devices(account_id).await
    }

    /// Mark a device trusted. Silently ignores devices that do not exist
    /// or belong to another account.
    pub async fn trust(&self, account_id: Uuid, device_id: Uuid) -> Result<()> {
        let Some(mut device) = self.store.find_device_by_id(device_id).await? else {
            return Ok(());
        };
        if device.account_id != account_id {
            debug!(account_id = %account_id, device_id = %device_id, "trust on foreign device ignored");
            return Ok(());
        }
        device.trusted = true;
        self.store.upsert_device(&device).await
    }

    /// Forget a device. Same ownership rule as [`Self::trust`].
    pub async fn remove(&self, account_id: Uuid, device_id: Uuid) -> Result<()> {
        let Some(device) = self.store.find_device_by_id(device_id).await? else {
            return Ok(());
        };
        if device.account_id != account_id {
            debug!(account_id = %account_id, device_id = %device_id, "remove on foreign device ignored");
            return Ok(());
        }
        self.store.delete_device(device_id).await
    }
}

/// Coarse display name derived from the user agent. Best effort only.
#[must_use]
pub fn device_name_from_user_agent(user_agent: &str) -> &'static str {
    let ua = user_agent.to_ascii_lowercase();
    if ua.contains("iphone") {
        "iPhone"
    } else if ua.contains("ipad") {
        "iPad"
    } else if ua.contains("android") {
        "Android Device"
    } else if ua.contains("edg") {
        "Edge Browser"
    } else if ua.contains("chrome") {
        "Chrome Browser"
    } else if ua.contains("firefox") {
        "Firefox Browser"
    } else if ua.contains("safari") {
        "Safari Browser"
    } else if !ua.is_empty() {
        "Web Browser"
    } else {
        "Unknown Device"
    }
}
