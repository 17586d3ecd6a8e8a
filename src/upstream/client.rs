use reqwest::{header::HeaderMap, Client, StatusCode};
use serde_json::Value;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::time;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::error::{StatsError, StatsResult};
use crate::upstream::credentials::{Credential, CredentialPool};
use crate::utils::mask_key;

const API_KEY_HEADER: &str = "API-Key";
const HEADER_RATELIMIT_LIMIT: &str = "ratelimit-limit";
const HEADER_RATELIMIT_REMAINING: &str = "ratelimit-remaining";
const HEADER_RATELIMIT_RESET: &str = "ratelimit-reset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    // Game-stats API, quota metered
    Api,
    // Account API resolving usernames and uuids
    Mojang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Player(String),
    Profiles(String),
    Profile(String),
    Auctions(u32),
    EndedAuctions,
    Collections,
    UuidByName(String),
    NameByUuid(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Endpoint::Player(_) => write!(f, "/v2/player"),
            Endpoint::Profiles(_) => write!(f, "/v2/skyblock/profiles"),
            Endpoint::Profile(_) => write!(f, "/v2/skyblock/profile"),
            Endpoint::Auctions(_) => write!(f, "/v2/skyblock/auctions"),
            Endpoint::EndedAuctions => write!(f, "/v2/skyblock/auctions_ended"),
            Endpoint::Collections => write!(f, "/v2/resources/skyblock/collections"),
            Endpoint::UuidByName(name) => write!(f, "/users/profiles/minecraft/{}", name),
            Endpoint::NameByUuid(uuid) => write!(f, "/user/profile/{}", uuid),
        }
    }
}

impl Endpoint {
    pub fn host(&self) -> Host {
        match self {
            Endpoint::UuidByName(_) | Endpoint::NameByUuid(_) => Host::Mojang,
            _ => Host::Api,
        }
    }

    /// Public resources and auction pages can be fetched without an API key.
    pub fn requires_key(&self) -> bool {
        match self {
            Endpoint::Player(_) | Endpoint::Profiles(_) | Endpoint::Profile(_) => true,
            Endpoint::Auctions(_) | Endpoint::EndedAuctions | Endpoint::Collections => false,
            Endpoint::UuidByName(_) | Endpoint::NameByUuid(_) => false,
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        match self {
            Endpoint::Player(uuid) | Endpoint::Profiles(uuid) => vec![("uuid", uuid.clone())],
            Endpoint::Profile(profile) => vec![("profile", profile.clone())],
            Endpoint::Auctions(page) => vec![("page", page.to_string())],
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub api_base_url: String,
    pub mojang_base_url: String,
    pub timeout: Duration,
    pub transport_retries: u32,
    pub transport_retry_delay: Duration,
    pub throttle_cooldown: Duration,
    pub disabled_cooldown: Duration,
}

impl UpstreamConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        UpstreamConfig {
            api_base_url: settings.api_base_url.clone(),
            mojang_base_url: settings.mojang_base_url.clone(),
            timeout: settings.api_timeout(),
            transport_retries: settings.transport_retries,
            transport_retry_delay: Duration::from_millis(500),
            throttle_cooldown: settings.throttle_cooldown(),
            disabled_cooldown: settings.disabled_cooldown(),
        }
    }
}

/// Result of a single request, before any retry decision.
#[derive(Debug)]
enum Outcome {
    Success(Value),
    Retryable(StatsError),
    Fatal(StatsError),
}

pub struct UpstreamClient {
    http_client: Client,
    config: UpstreamConfig,
    pool: Arc<CredentialPool>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig, pool: Arc<CredentialPool>) -> StatsResult<Self> {
        let http_client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http_client,
            config,
            pool,
        })
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    /// Issue a request, rotating keys and waiting out throttling until the API answers.
    ///
    /// Throttling, disabled endpoints and revoked keys are never surfaced. Transport failures
    /// are retried `transport_retries` times before giving up.
    pub async fn send(&self, endpoint: &Endpoint) -> StatsResult<Value> {
        let mut transport_failures = 0;

        loop {
            let credential = match endpoint.requires_key() {
                true => Some(self.pool.choose_key().ok_or(StatsError::NoCredentials)?),
                false => None,
            };

            let error = match self.attempt(endpoint, credential.as_deref()).await {
                Outcome::Success(value) => return Ok(value),
                Outcome::Fatal(e) => return Err(e),
                Outcome::Retryable(e) => e,
            };

            match error {
                StatsError::Throttled => {
                    if let Some(credential) = credential.as_deref() {
                        self.pool.exhaust(credential, self.config.throttle_cooldown);
                    }
                    warn!(
                        "Throttled on {}, cooling down for {:?}",
                        endpoint, self.config.throttle_cooldown
                    );
                    time::sleep(self.config.throttle_cooldown).await;
                }
                StatsError::EndpointDisabled => {
                    warn!(
                        "Endpoint {} temporarily disabled, retrying in {:?}",
                        endpoint, self.config.disabled_cooldown
                    );
                    time::sleep(self.config.disabled_cooldown).await;
                }
                StatsError::InvalidCredential => match credential.as_deref() {
                    Some(credential) => self.pool.remove(credential),
                    None => {
                        return Err(StatsError::Upstream(format!(
                            "{} rejected an anonymous request",
                            endpoint
                        )))
                    }
                },
                e => {
                    transport_failures += 1;
                    if transport_failures > self.config.transport_retries {
                        error!("Giving up on {} after {} attempts: {}", endpoint, transport_failures, e);
                        return Err(e);
                    }
                    warn!("Request to {} failed ({}), retrying", endpoint, e);
                    time::sleep(self.config.transport_retry_delay).await;
                }
            }
        }
    }

    async fn attempt(&self, endpoint: &Endpoint, credential: Option<&Credential>) -> Outcome {
        let base_url = match endpoint.host() {
            Host::Api => &self.config.api_base_url,
            Host::Mojang => &self.config.mojang_base_url,
        };
        let url = format!("{}{}", base_url, endpoint);

        let mut request = self.http_client.get(&url).query(&endpoint.query());
        if let Some(credential) = credential {
            request = request.header(API_KEY_HEADER, credential.key());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Outcome::Retryable(e.into()),
        };

        if let Some(credential) = credential {
            self.record_quota(credential, response.headers());
        }

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Outcome::Retryable(e.into()),
        };
        debug!("{} answered {} for {}", endpoint.host_name(), status, endpoint);

        classify(endpoint.host(), status, &body)
    }

    fn record_quota(&self, credential: &Credential, headers: &HeaderMap) {
        let limit = header_value::<u32>(headers, HEADER_RATELIMIT_LIMIT);
        let remaining = header_value::<u32>(headers, HEADER_RATELIMIT_REMAINING);
        let reset = header_value::<i64>(headers, HEADER_RATELIMIT_RESET);
        self.pool.record_response(credential, limit, remaining, reset);
        if remaining == Some(0) {
            debug!("API key {} has no call left", mask_key(credential.key()));
        }
    }
}

impl Endpoint {
    fn host_name(&self) -> &'static str {
        match self.host() {
            Host::Api => "API",
            Host::Mojang => "Mojang",
        }
    }
}

fn header_value<T: FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse::<T>().ok()
}

fn classify(host: Host, status: StatusCode, body: &str) -> Outcome {
    match host {
        Host::Mojang => match status {
            StatusCode::OK => match serde_json::from_str::<Value>(body) {
                Ok(json) => Outcome::Success(json),
                Err(e) => Outcome::Retryable(StatsError::Transport(e.to_string())),
            },
            // Unknown usernames answer with an empty 204 or a 404 depending on the route.
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Outcome::Fatal(StatsError::NotFound),
            StatusCode::TOO_MANY_REQUESTS => Outcome::Retryable(StatsError::Throttled),
            s if s.is_server_error() => Outcome::Retryable(StatsError::Transport(s.to_string())),
            s => Outcome::Fatal(StatsError::Upstream(s.to_string())),
        },
        Host::Api => {
            let json = match serde_json::from_str::<Value>(body) {
                Ok(json) => json,
                Err(e) => return Outcome::Retryable(StatsError::Transport(e.to_string())),
            };
            let success = json["success"].as_bool().unwrap_or(status.is_success());
            let throttled = json["throttle"].as_bool().unwrap_or(false);
            let cause = json["cause"].as_str().unwrap_or_default().to_lowercase();

            match (status, success) {
                _ if throttled || status == StatusCode::TOO_MANY_REQUESTS => {
                    Outcome::Retryable(StatsError::Throttled)
                }
                (StatusCode::FORBIDDEN, _) if cause.contains("invalid api key") => {
                    Outcome::Retryable(StatsError::InvalidCredential)
                }
                (StatusCode::SERVICE_UNAVAILABLE, _) => {
                    Outcome::Retryable(StatsError::EndpointDisabled)
                }
                _ if !success && cause.contains("disabled") => {
                    Outcome::Retryable(StatsError::EndpointDisabled)
                }
                (_, true) => Outcome::Success(json),
                (StatusCode::NOT_FOUND, _) => Outcome::Fatal(StatsError::NotFound),
                (s, _) if s.is_server_error() => {
                    Outcome::Retryable(StatsError::Transport(s.to_string()))
                }
                (s, _) => Outcome::Fatal(StatsError::Upstream(match cause.is_empty() {
                    true => s.to_string(),
                    false => cause,
                })),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn config(base_url: &str) -> UpstreamConfig {
        UpstreamConfig {
            api_base_url: base_url.to_string(),
            mojang_base_url: base_url.to_string(),
            timeout: Duration::from_secs(2),
            transport_retries: 2,
            transport_retry_delay: Duration::from_millis(1),
            throttle_cooldown: Duration::from_millis(5),
            disabled_cooldown: Duration::from_millis(5),
        }
    }

    fn client(base_url: &str, keys: &[&str]) -> UpstreamClient {
        let pool = CredentialPool::new(keys.iter().map(|k| k.to_string()).collect(), 5);
        UpstreamClient::new(config(base_url), Arc::new(pool)).unwrap()
    }

    #[tokio::test]
    async fn successful_response_updates_quota() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/player")
            .match_query(Matcher::UrlEncoded("uuid".into(), "abc".into()))
            .match_header(API_KEY_HEADER, "key-1")
            .with_status(200)
            .with_header(HEADER_RATELIMIT_LIMIT, "300")
            .with_header(HEADER_RATELIMIT_REMAINING, "299")
            .with_header(HEADER_RATELIMIT_RESET, "60")
            .with_body(r#"{"success":true,"player":{"uuid":"abc"}}"#)
            .create_async()
            .await;

        let client = client(&server.url(), &["key-1"]);
        let response = client.send(&Endpoint::Player("abc".to_string())).await.unwrap();

        assert_eq!(response["player"]["uuid"], "abc");
        mock.assert_async().await;
        let status = client.pool().status();
        assert_eq!(status[0].limit, 300);
        assert_eq!(status[0].remaining, 299);
        assert!(status[0].used);
    }

    #[tokio::test]
    async fn throttled_request_is_retried_after_cooldown() {
        let mut server = mockito::Server::new_async().await;
        let throttled = server
            .mock("GET", "/v2/skyblock/profiles")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_body(r#"{"success":false,"throttle":true,"cause":"Key throttle"}"#)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/v2/skyblock/profiles")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"success":true,"profiles":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client(&server.url(), &["key-1"]);
        let response = client
            .send(&Endpoint::Profiles("abc".to_string()))
            .await
            .unwrap();

        assert!(response["profiles"].is_array());
        throttled.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_key_is_removed_and_request_retried() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/v2/player")
            .match_query(Matcher::Any)
            .match_header(API_KEY_HEADER, "revoked")
            .with_status(403)
            .with_body(r#"{"success":false,"cause":"Invalid API key"}"#)
            .expect(1)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/v2/player")
            .match_query(Matcher::Any)
            .match_header(API_KEY_HEADER, "valid")
            .with_status(200)
            .with_body(r#"{"success":true,"player":null}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client(&server.url(), &["revoked", "valid"]);
        let response = client.send(&Endpoint::Player("abc".to_string())).await.unwrap();

        assert!(response["player"].is_null());
        rejected.assert_async().await;
        accepted.assert_async().await;
        assert_eq!(client.pool().len(), 1);
    }

    #[tokio::test]
    async fn disabled_endpoint_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let disabled = server
            .mock("GET", "/v2/skyblock/auctions")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body(r#"{"success":false,"cause":"This endpoint is currently disabled"}"#)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/v2/skyblock/auctions")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"success":true,"auctions":[]}"#)
            .expect(1)
            .create_async()
            .await;

        let client = client(&server.url(), &[]);
        client.send(&Endpoint::Auctions(0)).await.unwrap();

        disabled.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn keyless_endpoint_is_sent_without_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/resources/skyblock/collections")
            .match_header(API_KEY_HEADER, Matcher::Missing)
            .with_status(200)
            .with_body(r#"{"success":true,"collections":{}}"#)
            .create_async()
            .await;

        let client = client(&server.url(), &["key-1"]);
        client.send(&Endpoint::Collections).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn keyed_endpoint_without_any_key_fails() {
        let client = client("http://127.0.0.1:1", &[]);
        let result = client.send(&Endpoint::Player("abc".to_string())).await;
        assert!(matches!(result, Err(StatsError::NoCredentials)));
    }

    #[tokio::test]
    async fn transport_errors_surface_after_bounded_retries() {
        // Nothing listens on port 1
        let client = client("http://127.0.0.1:1", &[]);
        let result = client.send(&Endpoint::Collections).await;
        assert!(matches!(result, Err(StatsError::Transport(_))));
    }

    #[tokio::test]
    async fn unknown_username_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/users/profiles/minecraft/nobody_here")
            .with_status(204)
            .create_async()
            .await;

        let client = client(&server.url(), &[]);
        let result = client
            .send(&Endpoint::UuidByName("nobody_here".to_string()))
            .await;
        assert!(matches!(result, Err(StatsError::NotFound)));
    }

    #[test]
    fn client_errors_are_fatal() {
        let outcome = classify(
            Host::Api,
            StatusCode::BAD_REQUEST,
            r#"{"success":false,"cause":"Malformed UUID"}"#,
        );
        match outcome {
            Outcome::Fatal(StatsError::Upstream(cause)) => assert_eq!(cause, "malformed uuid"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn undecodable_body_is_a_transport_error() {
        let outcome = classify(Host::Api, StatusCode::OK, "<html>");
        assert!(matches!(outcome, Outcome::Retryable(StatsError::Transport(_))));
    }
}
