//! Authorization checks for the streams a logger knows about.

use serde::Serialize;
use wavelog_core::{AuthorizationInfo, ProviderError, StreamBinding, StreamType};

use crate::connection::ProviderConnection;

/// Authorization status of one registered stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamAuthorization {
    pub stream_id: String,
    pub stream_type: StreamType,
    pub authorized: bool,
    /// Granted limits, when the provider reports them.
    pub info: Option<AuthorizationInfo>,
}

impl StreamAuthorization {
    #[must_use]
    pub const fn is_authorized(&self) -> bool {
        self.authorized
    }
}

/// Query the provider about every stream in `registry`.
///
/// # Errors
/// Returns [`ProviderError::LostConnection`] if the connection is not bound
/// or drops mid-check.
pub async fn check_authorizations(
    connection: &ProviderConnection,
    api_key: &str,
    registry: &[StreamBinding],
) -> Result<Vec<StreamAuthorization>, ProviderError> {
    let mut result = Vec::with_capacity(registry.len());
    for binding in registry {
        let authorized = connection.is_authorized(api_key, &binding.id).await?;
        let info = if authorized {
            connection.authorization_info(api_key, &binding.id).await?
        } else {
            None
        };
        tracing::debug!(stream_id = %binding.id, authorized, "Checked authorization");
        result.push(StreamAuthorization {
            stream_id: binding.id.clone(),
            stream_type: binding.stream_type,
            authorized,
            info,
        });
    }
    Ok(result)
}

/// Ids of the registered streams the provider currently authorizes, in
/// registry order. This is the set a host passes to `start`.
///
/// # Errors
/// See [`check_authorizations`].
pub async fn authorized_streams(
    connection: &ProviderConnection,
    api_key: &str,
    registry: &[StreamBinding],
) -> Result<Vec<String>, ProviderError> {
    Ok(check_authorizations(connection, api_key, registry)
        .await?
        .into_iter()
        .filter(StreamAuthorization::is_authorized)
        .map(|a| a.stream_id)
        .collect())
}
