use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};
use tracing::warn;

use crate::credentials::CredentialStore;

/// Computes authorization material at send time. Both transports call in
/// here per request or per connection attempt, so a rotated credential is
/// picked up without rebuilding either transport.
pub struct AuthMiddleware {
    credentials: Arc<CredentialStore>,
}

impl AuthMiddleware {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self { credentials }
    }

    /// The current bearer value, or `None` when unauthenticated.
    pub async fn bearer(&self) -> Option<String> {
        self.credentials
            .current()
            .await
            .map(|credential| format!("Bearer {}", credential.as_str()))
    }

    /// Attaches the Authorization header when a credential is present,
    /// replacing any existing value. Requests without a credential pass
    /// through untouched.
    pub async fn apply(&self, headers: &mut HeaderMap) {
        let Some(bearer) = self.bearer().await else {
            return;
        };
        match HeaderValue::from_str(&bearer) {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(err) => {
                warn!(error = %err, "credential is not a valid header value; sending unauthenticated");
            }
        }
    }

    /// Connection parameters for the streaming handshake. Recomputed on
    /// every connection attempt, so reconnects after a credential rotation
    /// authenticate with the new value.
    pub async fn connection_params(&self) -> Option<Value> {
        self.bearer()
            .await
            .map(|bearer| json!({ "authorization": bearer }))
    }
}
