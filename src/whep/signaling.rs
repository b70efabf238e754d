//! WHEP signaling: SDP offer/answer exchange over HTTP

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, LOCATION};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{AppError, Result};

/// SDP content type required by WHEP
pub const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Local SDP offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpOffer {
    /// SDP content
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// SDP answer returned by the WHEP endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpAnswer {
    /// SDP content
    pub sdp: String,
    /// Session resource URL from the `Location` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            resource_url: None,
        }
    }

    pub fn with_resource(mut self, url: impl Into<String>) -> Self {
        self.resource_url = Some(url.into());
        self
    }
}

/// Offer/answer exchange with a media server
///
/// Implementations never retry; the reconnection controller owns that.
#[async_trait]
pub trait Signaler: Send + Sync {
    /// POST the offer for `camera_key` and return the server's answer
    async fn exchange(&self, camera_key: &str, offer: &SdpOffer) -> Result<SdpAnswer>;

    /// Release the server-side session, best effort
    async fn terminate(&self, _answer: &SdpAnswer) {}
}

/// Build `{base_url}/{camera_key}/whep`
///
/// Each segment of the camera key is percent-encoded on its own so
/// nested keys such as `site/cam1` keep their separators.
pub fn endpoint_url(base_url: &str, camera_key: &str) -> Result<String> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(AppError::Config("base_url is required".to_string()));
    }

    let segments: Vec<String> = camera_key
        .trim()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect();

    if segments.is_empty() {
        return Err(AppError::Config("camera key is empty".to_string()));
    }

    Ok(format!("{}/{}/whep", base, segments.join("/")))
}

/// `Authorization` header value for "user:password" credentials
pub fn basic_auth_header(credentials: &str) -> String {
    format!("Basic {}", BASE64.encode(credentials))
}

/// HTTP WHEP signaling client
#[derive(Clone)]
pub struct WhepSignaling {
    client: reqwest::Client,
    base_url: String,
    auth_header: Option<String>,
    timeout_ms: u64,
}

impl WhepSignaling {
    /// Create a signaling client for the configured media server
    pub fn new(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.signaling_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim().to_string(),
            auth_header: config
                .auth_credentials
                .as_deref()
                .filter(|c| !c.is_empty())
                .map(basic_auth_header),
            timeout_ms: config.signaling_timeout_ms,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::SignalingTimeout(self.timeout_ms)
        } else {
            AppError::Http(e)
        }
    }
}

#[async_trait]
impl Signaler for WhepSignaling {
    async fn exchange(&self, camera_key: &str, offer: &SdpOffer) -> Result<SdpAnswer> {
        let url = endpoint_url(&self.base_url, camera_key)?;
        debug!("WHEP POST {} ({} bytes offer)", url, offer.sdp.len());

        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer.sdp.clone());
        if let Some(ref auth) = self.auth_header {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            let message = match body.trim() {
                "" => status.canonical_reason().unwrap_or("request failed").to_string(),
                text => text.to_string(),
            };
            return Err(AppError::Signaling {
                status: status.as_u16(),
                message,
            });
        }

        if body.trim().is_empty() {
            return Err(AppError::Signaling {
                status: status.as_u16(),
                message: "empty SDP answer".to_string(),
            });
        }

        let mut answer = SdpAnswer::new(body);
        if let Some(location) = location {
            // Location may be relative to the endpoint
            match reqwest::Url::parse(&url).and_then(|base| base.join(&location)) {
                Ok(resource) => answer = answer.with_resource(resource.to_string()),
                Err(e) => debug!("Ignoring invalid WHEP Location '{}': {}", location, e),
            }
        }

        Ok(answer)
    }

    async fn terminate(&self, answer: &SdpAnswer) {
        let Some(ref resource) = answer.resource_url else {
            return;
        };

        let mut request = self.client.delete(resource);
        if let Some(ref auth) = self.auth_header {
            request = request.header(AUTHORIZATION, auth);
        }

        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("WHEP session {} released", resource);
            }
            Ok(resp) => debug!("WHEP DELETE {} returned {}", resource, resp.status()),
            Err(e) => warn!("WHEP DELETE {} failed: {}", resource, e),
        }
    }
}
