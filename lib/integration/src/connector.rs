//! Outbound adapters to the messaging channel and the business system.
//!
//! The core never retries these calls. Delivery failures are reported to
//! the caller; correlation failures are logged and ignored by the
//! dispatcher.

use crate::error::ConnectorError;
use async_trait::async_trait;
use reqwest::{Client, Response};
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use switchboard_core::{EventId, Identity};
use tracing::{debug, info, instrument};

/// Default timeout for adapter HTTP calls.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Proof that a reply was handed to the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Channel-side id of the outbound message, when reported.
    pub message_id: Option<String>,
}

/// Sends reply text to an identity.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Delivers `text` to `to`, threading it under `reply_to` when given.
    ///
    /// # Errors
    ///
    /// Returns a `ConnectorError` if the channel refuses or is unreachable.
    async fn deliver(
        &self,
        to: &Identity,
        text: &str,
        reply_to: Option<&EventId>,
    ) -> Result<DeliveryRecord, Report<ConnectorError>>;
}

/// Ensures a business record exists for an identity.
#[async_trait]
pub trait RecordCorrelator: Send + Sync {
    /// Creates or finds the record for `identity`.
    ///
    /// # Errors
    ///
    /// Returns a `ConnectorError` on failure; callers treat it as non-fatal.
    async fn ensure_record(&self, identity: &Identity) -> Result<(), Report<ConnectorError>>;
}

/// Connection settings for an HTTP adapter.
#[derive(Clone, Deserialize)]
pub struct HttpEndpoint {
    /// Endpoint URL.
    pub url: String,
    /// Bearer token sent as `Authorization`.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_HTTP_TIMEOUT.as_secs()
}

impl std::fmt::Debug for HttpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEndpoint")
            .field("url", &self.url)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl HttpEndpoint {
    /// Creates an endpoint with no credentials and the default timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub(crate) fn client(&self) -> Result<Client, Report<ConnectorError>> {
        if self.url.trim().is_empty() {
            return Err(ConnectorError::InvalidConfig {
                reason: "endpoint URL is empty".to_string(),
            }
            .into());
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(self.timeout_seconds))
            .build()
            .map_err(|e| ConnectorError::InvalidConfig {
                reason: e.to_string(),
            })?;
        Ok(client)
    }

    /// POSTs `body` as JSON and returns the decoded JSON answer (or null
    /// for an empty body).
    pub(crate) async fn post_json(
        &self,
        client: &Client,
        body: &JsonValue,
    ) -> Result<JsonValue, Report<ConnectorError>> {
        let mut request = client.post(&self.url).json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(transport_error)?;
        read_json(response).await
    }
}

async fn read_json(response: Response) -> Result<JsonValue, Report<ConnectorError>> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;

    if !status.is_success() {
        return Err(ConnectorError::Rejected {
            status: status.as_u16(),
            body,
        }
        .into());
    }
    if body.trim().is_empty() {
        return Ok(JsonValue::Null);
    }
    let value = serde_json::from_str(&body).map_err(|e| ConnectorError::ProtocolError {
        reason: format!("response is not JSON: {e}"),
    })?;
    Ok(value)
}

fn transport_error(e: reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::Timeout
    } else {
        ConnectorError::ConnectionFailed {
            reason: e.to_string(),
        }
    }
}

/// Delivers replies by POSTing `{to, text, reply_to}` to a channel gateway.
pub struct HttpDeliveryAdapter {
    client: Client,
    endpoint: HttpEndpoint,
}

impl std::fmt::Debug for HttpDeliveryAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDeliveryAdapter")
            .field("url", &self.endpoint.url)
            .finish_non_exhaustive()
    }
}

impl HttpDeliveryAdapter {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidConfig` for an empty URL.
    pub fn new(endpoint: HttpEndpoint) -> Result<Self, Report<ConnectorError>> {
        Ok(Self {
            client: endpoint.client()?,
            endpoint,
        })
    }
}

#[async_trait]
impl DeliveryAdapter for HttpDeliveryAdapter {
    #[instrument(skip(self, text), fields(to = %to, chars = text.chars().count()))]
    async fn deliver(
        &self,
        to: &Identity,
        text: &str,
        reply_to: Option<&EventId>,
    ) -> Result<DeliveryRecord, Report<ConnectorError>> {
        let body = json!({
            "to": to.as_str(),
            "text": text,
            "content_type": "text",
            "reply_to": reply_to.map(EventId::as_str),
        });
        let answer = self.endpoint.post_json(&self.client, &body).await?;

        let message_id = ["id", "message_id", "name"]
            .iter()
            .find_map(|key| answer.get(key).and_then(JsonValue::as_str))
            .map(str::to_string);
        info!(message_id = ?message_id, "reply delivered");
        Ok(DeliveryRecord { message_id })
    }
}

/// Delivery adapter that only logs; used when no gateway is configured.
#[derive(Debug, Default)]
pub struct LogDeliveryAdapter;

#[async_trait]
impl DeliveryAdapter for LogDeliveryAdapter {
    async fn deliver(
        &self,
        to: &Identity,
        text: &str,
        _reply_to: Option<&EventId>,
    ) -> Result<DeliveryRecord, Report<ConnectorError>> {
        info!(to = %to, chars = text.chars().count(), "no delivery gateway configured, reply not sent");
        Ok(DeliveryRecord::default())
    }
}

/// Correlates identities by POSTing `{identity}` to the business system.
pub struct HttpRecordCorrelator {
    client: Client,
    endpoint: HttpEndpoint,
}

impl HttpRecordCorrelator {
    /// Creates the correlator.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::InvalidConfig` for an empty URL.
    pub fn new(endpoint: HttpEndpoint) -> Result<Self, Report<ConnectorError>> {
        Ok(Self {
            client: endpoint.client()?,
            endpoint,
        })
    }
}

#[async_trait]
impl RecordCorrelator for HttpRecordCorrelator {
    #[instrument(skip(self), fields(identity = %identity))]
    async fn ensure_record(&self, identity: &Identity) -> Result<(), Report<ConnectorError>> {
        self.endpoint
            .post_json(&self.client, &json!({"identity": identity.as_str()}))
            .await?;
        debug!("record ensured");
        Ok(())
    }
}

/// Correlator that does nothing.
#[derive(Debug, Default)]
pub struct NoopCorrelator;

#[async_trait]
impl RecordCorrelator for NoopCorrelator {
    async fn ensure_record(&self, _identity: &Identity) -> Result<(), Report<ConnectorError>> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identity(s: &str) -> Identity {
        s.parse().unwrap()
    }

    #[test]
    fn empty_url_is_rejected() {
        let err = HttpDeliveryAdapter::new(HttpEndpoint::new(" ")).unwrap_err();
        assert!(matches!(
            err.current_context(),
            ConnectorError::InvalidConfig { .. }
        ));
    }

    #[tokio::test]
    async fn delivery_posts_reply_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("authorization", "Bearer gateway-token"))
            .and(body_partial_json(json!({
                "to": "+391234",
                "text": "Ecco il codice TIR-002",
                "reply_to": "wamid.1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "msg-42"})))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = HttpDeliveryAdapter::new(
            HttpEndpoint::new(format!("{}/send", server.uri())).with_bearer_token("gateway-token"),
        )
        .unwrap();

        let record = adapter
            .deliver(
                &identity("+391234"),
                "Ecco il codice TIR-002",
                Some(&"wamid.1".parse().unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(record.message_id.as_deref(), Some("msg-42"));
    }

    #[tokio::test]
    async fn delivery_surfaces_gateway_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let adapter = HttpDeliveryAdapter::new(HttpEndpoint::new(server.uri())).unwrap();
        let err = adapter
            .deliver(&identity("+391234"), "ciao", None)
            .await
            .unwrap_err();
        assert_eq!(
            err.current_context(),
            &ConnectorError::Rejected {
                status: 502,
                body: "upstream down".to_string()
            }
        );
    }

    #[tokio::test]
    async fn correlator_accepts_empty_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/records"))
            .and(body_partial_json(json!({"identity": "+391234"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let correlator =
            HttpRecordCorrelator::new(HttpEndpoint::new(format!("{}/records", server.uri())))
                .unwrap();
        correlator.ensure_record(&identity("+391234")).await.unwrap();
    }
}
