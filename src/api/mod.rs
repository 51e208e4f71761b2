//! HTTP client for the Fitbit body-measurement API.

pub mod records;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result};
use crate::sync::partition::DateRange;

pub const DEFAULT_BASE_URL: &str = "https://api.fitbit.com";

const MAX_RETRIES: u32 = 3;
const BACKOFF_SECONDS: &[u64] = &[60, 120, 240];

/// Measurement log kinds served by the body endpoint. Weight is the only
/// kind the Aria scale produces; the enum keeps the URL table closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    Weight,
}

impl MeasurementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementKind::Weight => "weight",
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "weight" => Ok(MeasurementKind::Weight),
            other => Err(Error::UnknownKind(other.to_string())),
        }
    }
}

/// Client for the Fitbit API.
///
/// The access token is an opaque capability: the client decorates outgoing
/// requests with it and can drop it (`invalidate_token`) so the next sync
/// re-authenticates. Token acquisition itself happens elsewhere; while an
/// exchange is in flight the `authorizing` flag is up and new syncs must not
/// issue requests.
#[derive(Clone)]
pub struct FitbitClient {
    base_url: String,
    token: Arc<Mutex<Option<SecretString>>>,
    authorizing: Arc<AtomicBool>,
    client: reqwest::Client,
}

impl FitbitClient {
    pub fn new(base_url: &str, token: Option<SecretString>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: Arc::new(Mutex::new(token)),
            authorizing: Arc::new(AtomicBool::new(false)),
            client: reqwest::Client::new(),
        }
    }

    /// Build a client from the environment: `FITBIT_ACCESS_TOKEN` (optional;
    /// requests fail with an auth error until a token is set) and
    /// `ARIADW_BASE_URL` (defaults to the production API).
    pub fn from_env() -> Self {
        Self::from_env_with(|k| std::env::var(k).ok())
    }

    /// Testable helper that reads configuration through the provided lookup
    /// function, so tests never mutate the process environment.
    pub fn from_env_with<F>(mut get: F) -> Self
    where
        F: FnMut(&str) -> Option<String>,
    {
        let token = get("FITBIT_ACCESS_TOKEN").map(|t| SecretString::new(t.into()));
        let base_url = get("ARIADW_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(&base_url, token)
    }

    pub fn set_token(&self, token: SecretString) {
        *self.token.lock().unwrap() = Some(token);
    }

    pub fn has_token(&self) -> bool {
        self.token.lock().unwrap().is_some()
    }

    /// Drop the cached credential so the next sync re-authenticates.
    pub fn invalidate_token(&self) {
        log::warn!("invalidating cached access token");
        *self.token.lock().unwrap() = None;
    }

    /// True while a token exchange is in flight. A sync requested during an
    /// exchange must abort its own fetch issuance rather than interleave two
    /// authentication attempts.
    pub fn authorization_in_progress(&self) -> bool {
        self.authorizing.load(Ordering::SeqCst)
    }

    /// Raised and lowered by the (external) token-exchange flow.
    pub fn mark_authorizing(&self, in_progress: bool) {
        self.authorizing.store(in_progress, Ordering::SeqCst);
    }

    /// URL for one request window:
    /// `{base}/1/user/-/body/log/{kind}/date/{start}/{end}.json`.
    pub fn window_url(&self, kind: MeasurementKind, range: &DateRange) -> String {
        format!(
            "{}/1/user/-/body/log/{}/date/{}/{}.json",
            self.base_url,
            kind.as_str(),
            range.start.format("%Y-%m-%d"),
            range.end.format("%Y-%m-%d")
        )
    }

    /// Add credentials and the locale header to an outgoing request.
    /// Accept-Language selects the API's unit system (en_US: pounds).
    fn decorate(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.token.lock().unwrap();
        let token = token
            .as_ref()
            .ok_or_else(|| Error::Auth("no access token; run `ariadw auth set-token`".into()))?;
        Ok(request
            .bearer_auth(token.expose_secret())
            .header("Accept-Language", "en_US"))
    }

    /// Fetch one window, returning the raw response body.
    ///
    /// 429 responses are retried on the backoff schedule; 401/403 map to an
    /// auth error so the coordinator can invalidate the token; any other
    /// non-success status is an API error. All of these are per-window
    /// failures; the caller isolates them from sibling windows.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt: u32 = 0;
        loop {
            let request = self.decorate(self.client.get(url))?;
            let resp = request.send().await?;
            let status = resp.status();

            if status.is_success() {
                return Ok(resp.bytes().await?.to_vec());
            }

            if status.as_u16() == 429 && attempt < MAX_RETRIES {
                backoff_sleep(attempt).await;
                attempt += 1;
                continue;
            }

            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(256).collect();
            return Err(match status.as_u16() {
                401 | 403 => Error::Auth(snippet),
                s => Error::Api {
                    status: s,
                    message: snippet,
                },
            });
        }
    }
}

/// Sleep for the backoff duration before retrying a rate-limited request.
async fn backoff_sleep(attempt: u32) {
    let wait = BACKOFF_SECONDS
        .get(attempt as usize)
        .copied()
        .unwrap_or(240);
    log::warn!(
        "Rate limited (429). Waiting {wait}s before retry {}/{MAX_RETRIES}",
        attempt + 1
    );
    tokio::time::sleep(Duration::from_secs(wait)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn range(y: i32, m: u32, d1: u32, d2: u32) -> DateRange {
        DateRange {
            start: NaiveDate::from_ymd_opt(y, m, d1).unwrap(),
            end: NaiveDate::from_ymd_opt(y, m, d2).unwrap(),
        }
    }

    fn test_client(base_url: &str) -> FitbitClient {
        FitbitClient::new(base_url, Some(SecretString::new("token".into())))
    }

    #[test]
    fn test_window_url_format() {
        let client = test_client("https://api.fitbit.com/");
        let url = client.window_url(MeasurementKind::Weight, &range(2018, 10, 1, 31));
        assert_eq!(
            url,
            "https://api.fitbit.com/1/user/-/body/log/weight/date/2018-10-01/2018-10-31.json"
        );
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!(
            "weight".parse::<MeasurementKind>().unwrap(),
            MeasurementKind::Weight
        );
        assert!(matches!(
            "steps".parse::<MeasurementKind>(),
            Err(Error::UnknownKind(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_returns_body_with_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/1/user/-/body/log/weight/date/2018-10-01/2018-10-31.json",
            ))
            .and(header("Authorization", "Bearer token"))
            .and(header("Accept-Language", "en_US"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"weight":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let url = client.window_url(MeasurementKind::Weight, &range(2018, 10, 1, 31));
        let body = client.fetch(&url).await.unwrap();
        assert_eq!(body, br#"{"weight":[]}"#);
    }

    #[tokio::test]
    async fn test_fetch_401_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let url = client.window_url(MeasurementKind::Weight, &range(2019, 1, 1, 31));
        assert!(matches!(client.fetch(&url).await, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_fetch_500_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let url = client.window_url(MeasurementKind::Weight, &range(2019, 1, 1, 31));
        match client.fetch(&url).await {
            Err(Error::Api { status, .. }) => assert_eq!(status, 500),
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_without_token_is_auth_error_and_no_request() {
        let server = MockServer::start().await;
        // No mocks mounted: an issued request would 404 into an Api error,
        // so an Auth error proves decoration failed before sending.
        let client = FitbitClient::new(&server.uri(), None);
        let url = client.window_url(MeasurementKind::Weight, &range(2019, 1, 1, 31));
        assert!(matches!(client.fetch(&url).await, Err(Error::Auth(_))));
    }

    #[test]
    fn test_invalidate_token() {
        let client = test_client("http://localhost");
        assert!(client.has_token());
        client.invalidate_token();
        assert!(!client.has_token());
    }

    #[test]
    fn test_from_env_with() {
        let client = FitbitClient::from_env_with(|k| match k {
            "FITBIT_ACCESS_TOKEN" => Some("sekrit".into()),
            "ARIADW_BASE_URL" => Some("http://localhost:9999/".into()),
            _ => None,
        });
        assert!(client.has_token());
        assert_eq!(client.base_url, "http://localhost:9999");
    }
}
