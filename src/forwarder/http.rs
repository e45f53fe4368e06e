//! HTTP forwarder
//!
//! Issues one request per message: `{method} {endpoint}` with the payload as
//! body and a fixed content type, then reads the whole response.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;

use super::{Forward, ForwardError, ForwardOutcome, InboundMessage};
use crate::bridge::BridgeError;
use crate::config::BridgeOptions;

/// Resolve the endpoint passed to `connect` against the configured HTTP target.
///
/// Absolute `http://` endpoints are used as is. Anything else is joined onto
/// the target, which gets an `http://` scheme when it has none. An empty
/// endpoint means the target itself.
pub fn resolve_endpoint(http_target: &str, endpoint: &str) -> Result<Uri, BridgeError> {
    let endpoint = endpoint.trim();

    let url = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        let target = http_target.trim().trim_end_matches('/');
        if target.is_empty() {
            return Err(BridgeError::InvalidConfig(if endpoint.is_empty() {
                "no HTTP endpoint or target configured".to_string()
            } else {
                format!("relative endpoint '{}' needs an HTTP target", endpoint)
            }));
        }

        let base = if target.contains("://") {
            target.to_string()
        } else {
            format!("http://{}", target)
        };

        match endpoint {
            "" => base,
            path if path.starts_with('/') => format!("{}{}", base, path),
            path => format!("{}/{}", base, path),
        }
    };

    let uri: Uri = url
        .parse()
        .map_err(|e| BridgeError::InvalidConfig(format!("invalid endpoint '{}': {}", url, e)))?;

    match uri.scheme_str() {
        Some("http") => {}
        Some(scheme) => {
            return Err(BridgeError::InvalidConfig(format!(
                "unsupported scheme '{}' in endpoint '{}'",
                scheme, url
            )))
        }
        None => {
            return Err(BridgeError::InvalidConfig(format!(
                "endpoint '{}' has no scheme",
                url
            )))
        }
    }

    if uri.host().map_or(true, str::is_empty) {
        return Err(BridgeError::InvalidConfig(format!(
            "endpoint '{}' has no host",
            url
        )));
    }

    Ok(uri)
}

/// Forwards messages to an HTTP endpoint
pub struct HttpForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoint: Uri,
    method: Method,
    content_type: HeaderValue,
    request_timeout: Duration,
}

impl HttpForwarder {
    /// Build a forwarder for `endpoint` using the method, content type and
    /// timeout from `options`
    pub fn new(endpoint: &str, options: &BridgeOptions) -> Result<Self, BridgeError> {
        let endpoint = resolve_endpoint(&options.http_target, endpoint)?;
        let method = options.method()?;
        let content_type = HeaderValue::from_str(&options.content_type).map_err(|_| {
            BridgeError::InvalidConfig(format!("invalid content type '{}'", options.content_type))
        })?;

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            endpoint,
            method,
            content_type,
            request_timeout: options.request_timeout,
        })
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    async fn send(&self, payload: Bytes) -> Result<ForwardOutcome, ForwardError> {
        let request = Request::builder()
            .method(self.method.clone())
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, self.content_type.clone())
            .body(Full::new(payload))
            .map_err(|e| ForwardError::Request(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ForwardError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ForwardError::Body(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(ForwardError::Status { status, body });
        }

        Ok(ForwardOutcome { status, body })
    }
}

#[async_trait]
impl Forward for HttpForwarder {
    fn target(&self) -> String {
        format!("{} {}", self.method, self.endpoint)
    }

    async fn forward(&self, message: &InboundMessage) -> Result<ForwardOutcome, ForwardError> {
        timeout(self.request_timeout, self.send(message.payload.clone()))
            .await
            .map_err(|_| ForwardError::Timeout)?
    }
}
