use crate::Result;
use crate::transport::{Credential, CredentialBroker, CredentialRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Ephemeral credentials, fetched lazily and reused until close to expiry.
///
/// A credential without an expiry is never reused.
pub(crate) struct CredentialCache {
    broker: Arc<dyn CredentialBroker>,
    refresh_margin: Duration,
    entries: Mutex<HashMap<CredentialRequest, Credential>>,
}

impl CredentialCache {
    pub(crate) fn new(broker: Arc<dyn CredentialBroker>, refresh_margin: Duration) -> Self {
        Self {
            broker,
            refresh_margin,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// # Errors
    /// Propagates the broker's [`crate::Error::Credential`].
    pub(crate) async fn get(&self, request: &CredentialRequest) -> Result<Credential> {
        if let Some(credential) = self.cached(request, unix_now()) {
            tracing::debug!(model = %credential.model, "Reusing cached credential");
            return Ok(credential);
        }

        let credential = self.broker.fetch(request).await?;
        if credential.expires_at > 0 {
            self.entries.lock().insert(request.clone(), credential.clone());
        }
        Ok(credential)
    }

    fn cached(&self, request: &CredentialRequest, now: u64) -> Option<Credential> {
        let mut entries = self.entries.lock();
        let fresh = entries
            .get(request)
            .is_some_and(|c| c.expires_at > now.saturating_add(self.refresh_margin.as_secs()));
        if fresh {
            entries.get(request).cloned()
        } else {
            entries.remove(request);
            None
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
