use super::{Credential, CredentialBroker, CredentialRequest, Signaling};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const DEFAULT_REALTIME_URL: &str = "https://api.openai.com/v1/realtime";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: Option<String>,
    #[serde(default)]
    expires_at: u64,
}

#[derive(Debug, Deserialize)]
struct BrokerResponse {
    client_secret: Option<ClientSecret>,
    model: Option<String>,
}

#[allow(clippy::result_large_err)]
fn build_client(timeout: Duration, pool_idle_timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(pool_idle_timeout)
        .build()?)
}

#[allow(clippy::result_large_err)]
fn bearer(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Credential broker reached over HTTP.
///
/// `POST {model, voice, instructions?}` and expect
/// `{client_secret: {value, expires_at}, model}` back.
#[derive(Clone, Debug)]
pub struct HttpCredentialBroker {
    client: Client,
    url: Url,
    auth_header: Option<HeaderValue>,
}

impl HttpCredentialBroker {
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new(url: &str) -> Result<Self> {
        Self::new_with_timeouts(url, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(url: &str, timeout: Duration, pool_idle_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, pool_idle_timeout)?,
            url: Url::parse(url)?,
            auth_header: None,
        })
    }

    /// Authenticate broker calls with a bearer key.
    ///
    /// # Errors
    /// Returns an error if the key is not a valid header value.
    #[allow(clippy::result_large_err)]
    pub fn with_api_key(mut self, api_key: &str) -> Result<Self> {
        self.auth_header = Some(bearer(api_key)?);
        Ok(self)
    }
}

fn credential_error(status: Option<StatusCode>, body: impl Into<String>) -> Error {
    Error::Credential {
        status: status.map(|s| s.as_u16()),
        body: body.into(),
    }
}

#[async_trait]
impl CredentialBroker for HttpCredentialBroker {
    async fn fetch(&self, request: &CredentialRequest) -> Result<Credential> {
        let mut req = self.client.post(self.url.clone()).json(request);
        if let Some(auth) = &self.auth_header {
            req = req.header(AUTHORIZATION, auth);
        }

        let res = req.send().await.map_err(|e| credential_error(None, e.to_string()))?;
        let status = res.status();
        let body = res.text().await.map_err(|e| credential_error(Some(status), e.to_string()))?;
        if !status.is_success() {
            tracing::warn!(%status, "Credential broker rejected request");
            return Err(credential_error(Some(status), body));
        }

        let parsed: BrokerResponse = serde_json::from_str(&body)
            .map_err(|e| credential_error(Some(status), format!("{e}: {body}")))?;
        let secret = parsed.client_secret.and_then(|s| s.value.map(|v| (v, s.expires_at)));
        let Some((token, expires_at)) = secret.filter(|(v, _)| !v.is_empty()) else {
            return Err(credential_error(
                Some(status),
                format!("missing client_secret.value: {body}"),
            ));
        };

        let model = parsed.model.unwrap_or_else(|| request.model.clone());
        tracing::debug!(%model, expires_at, "Acquired ephemeral credential");
        Ok(Credential { token, expires_at, model })
    }
}

/// SDP offer/answer exchange over HTTP.
///
/// `POST <endpoint>?model=<model>` with `Content-Type: application/sdp`; the response
/// body is the answer.
#[derive(Clone, Debug)]
pub struct HttpSignaling {
    client: Client,
    endpoint: Url,
}

impl HttpSignaling {
    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new(endpoint: &str) -> Result<Self> {
        Self::new_with_timeouts(endpoint, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(endpoint: &str, timeout: Duration, pool_idle_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, pool_idle_timeout)?,
            endpoint: Url::parse(endpoint)?,
        })
    }

    /// The OpenAI realtime endpoint.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn openai() -> Result<Self> {
        Self::new(DEFAULT_REALTIME_URL)
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn exchange(&self, offer_sdp: &str, credential: &Credential) -> Result<String> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("model", &credential.model);

        let res = self
            .client
            .post(url)
            .header(AUTHORIZATION, bearer(&credential.token)?)
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_owned())
            .send()
            .await
            .map_err(Error::negotiation)?;

        let status = res.status();
        let body = res.text().await.map_err(Error::negotiation)?;
        if !status.is_success() {
            tracing::warn!(%status, "Realtime endpoint rejected SDP offer");
            return Err(Error::Negotiation { status: Some(status.as_u16()), body });
        }
        Ok(body)
    }
}
