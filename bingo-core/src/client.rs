use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::mutation::{MutationKind, Payload};

const STATUS_ROUTE: &str = "status";

#[derive(Debug, Error)]
pub enum BingoError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("endpoint must use http:// or https://: {0}")]
    InvalidEndpoint(String),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("remote reported failure: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Validation,
    Permanent,
}

/// What came back from a mutation request.
///
/// The remote confirms a mutation through the `success` field of its
/// response body. A response whose body cannot be read as that document
/// (empty, opaque, an HTML login page) proves nothing about whether the
/// mutation was applied and is reported as `Unconfirmed`.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Confirmed {
        status: StatusCode,
        response: MutationResponse,
        retry_after: Option<Duration>,
    },
    Unconfirmed {
        status: StatusCode,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MutationResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "errorType")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub retryable: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

impl MutationResponse {
    pub fn is_validation_error(&self) -> bool {
        self.error_type
            .as_deref()
            .is_some_and(|kind| kind.eq_ignore_ascii_case("validation"))
    }

    pub fn reason(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "remote reported failure".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteStatus {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Serialize)]
struct MutationEnvelope<'a> {
    kind: MutationKind,
    payload: &'a Payload,
}

#[derive(Clone)]
pub struct BingoClient {
    http: Client,
    endpoint: Url,
    token: Option<String>,
}

impl BingoClient {
    pub fn new(endpoint: &str) -> Result<Self, BingoError> {
        Self::with_options(endpoint, None, None)
    }

    pub fn with_options(
        endpoint: &str,
        token: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, BingoError> {
        let endpoint = Url::parse(endpoint.trim())?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(BingoError::InvalidEndpoint(endpoint.to_string()));
        }
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            endpoint,
            token: token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn submit_mutation(
        &self,
        kind: MutationKind,
        payload: &Payload,
    ) -> Result<Delivery, BingoError> {
        let url = self.route_url(kind.route());
        let request = self
            .http
            .post(url)
            .header("Accept", "application/json")
            .json(&MutationEnvelope { kind, payload });
        let response = self.authorize(request).send().await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await?;
        tracing::debug!(%kind, %status, bytes = body.len(), "mutation response received");

        match parse_body::<MutationResponse>(&body) {
            Some(response) => Ok(Delivery::Confirmed {
                status,
                response,
                retry_after,
            }),
            None if status.is_success() => Ok(Delivery::Unconfirmed { status }),
            None => Err(BingoError::Api {
                status,
                body,
                retry_after,
            }),
        }
    }

    pub async fn status(&self) -> Result<RemoteStatus, BingoError> {
        let url = self.route_url(STATUS_ROUTE);
        let response = self.authorize(self.http.get(url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(BingoError::Api {
                status,
                body,
                retry_after,
            });
        }
        let remote: RemoteStatus = response.json().await?;
        if !remote.success {
            return Err(BingoError::Rejected(
                remote
                    .message
                    .unwrap_or_else(|| "status check failed".to_string()),
            ));
        }
        Ok(remote)
    }

    fn route_url(&self, route: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("path", route);
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl BingoError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            BingoError::Api { status, .. } => classify_api_status(*status),
            BingoError::Request(_) | BingoError::Rejected(_) => ApiErrorClass::Transient,
            BingoError::Url(_) | BingoError::InvalidEndpoint(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BingoError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Only a payload the server rejected as malformed is worth giving up on;
/// auth, routing and server trouble can clear up without the payload changing.
pub fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY
    ) {
        ApiErrorClass::Validation
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT
                | StatusCode::CONFLICT
                | StatusCode::TOO_EARLY
                | StatusCode::NOT_FOUND
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &str) -> Option<T> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(
        at.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}
