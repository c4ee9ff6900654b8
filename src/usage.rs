use std::error::Error as _;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backoff::BackoffGate;
use crate::config::ApiCacheConfig;
use crate::error::SourceError;
use crate::process::{KEYCHAIN_TIMEOUT, run_with_timeout};
use crate::store::{CacheBackend, CacheStore, FileBackend, TtlRule};
use crate::util::first_present;

pub const USAGE_CACHE_VERSION: &str = "1";
const USAGE_CACHE_KEY: &str = "usage";

const USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const USAGE_BETA_HEADER: &str = "oauth-2025-04-20";
const USAGE_HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const USER_AGENT: &str = concat!("claude-hud/", env!("CARGO_PKG_VERSION"));

const KEYCHAIN_PROGRAM: &str = "/usr/bin/security";
const KEYCHAIN_SERVICE: &str = "Claude Code-credentials";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub subscription_type: String,
}

#[derive(Debug, Deserialize)]
struct CredentialsDocument {
    #[serde(rename = "claudeAiOauth")]
    oauth: Option<OauthCredentials>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OauthCredentials {
    access_token: Option<String>,
    subscription_type: Option<String>,
    expires_at: Option<i64>,
}

/// `Ok(None)` for a well-formed document without a usable, unexpired token.
pub fn parse_credentials(raw: &str, now_ms: i64) -> Result<Option<Credentials>, SourceError> {
    let doc: CredentialsDocument =
        serde_json::from_str(raw).map_err(|err| SourceError::Parse(err.to_string()))?;
    let Some(oauth) = doc.oauth else {
        return Ok(None);
    };
    let Some(access_token) = oauth.access_token.filter(|token| !token.is_empty()) else {
        return Ok(None);
    };
    if oauth.expires_at.is_some_and(|expires_at| expires_at <= now_ms) {
        debug!("oauth token has expired");
        return Ok(None);
    }
    Ok(Some(Credentials {
        access_token,
        subscription_type: oauth.subscription_type.unwrap_or_default(),
    }))
}

/// Display name for a subscription; `None` for API-key users, who have no
/// quota to show.
pub fn plan_name(subscription_type: &str) -> Option<String> {
    let lower = subscription_type.to_ascii_lowercase();
    if lower.contains("max") {
        return Some("Max".to_string());
    }
    if lower.contains("pro") {
        return Some("Pro".to_string());
    }
    if lower.contains("team") {
        return Some("Team".to_string());
    }
    if subscription_type.is_empty() || lower.contains("api") {
        return None;
    }
    let mut chars = subscription_type.chars();
    let first = chars.next()?;
    Some(format!("{}{}", first.to_uppercase(), chars.as_str()))
}

pub trait CredentialSource {
    fn keychain(&self, now: DateTime<Utc>) -> Option<Credentials>;
    fn file(&self, now: DateTime<Utc>) -> Option<Credentials>;
}

/// Keychain first, then the credentials file. A keychain token without a
/// subscription type borrows the file's.
pub fn read_credentials(source: &impl CredentialSource, now: DateTime<Utc>) -> Option<Credentials> {
    let from_file = || source.file(now);
    let from_keychain = || {
        let mut creds = source.keychain(now)?;
        if creds.subscription_type.is_empty()
            && let Some(file_creds) = from_file()
            && !file_creds.subscription_type.is_empty()
        {
            creds.subscription_type = file_creds.subscription_type;
        }
        Some(creds)
    };
    let providers: [&dyn Fn() -> Option<Credentials>; 2] = [&from_keychain, &from_file];
    first_present(&providers)
}

pub struct SystemCredentials<B = FileBackend> {
    credentials_path: PathBuf,
    gate: BackoffGate<B>,
    keychain_program: Option<PathBuf>,
}

impl<B: CacheBackend> SystemCredentials<B> {
    /// The keychain is only consulted on macOS.
    pub fn new(credentials_path: PathBuf, gate: BackoffGate<B>) -> Self {
        let keychain_program = cfg!(target_os = "macos").then(|| PathBuf::from(KEYCHAIN_PROGRAM));
        Self {
            credentials_path,
            gate,
            keychain_program,
        }
    }

    pub fn with_keychain_program(mut self, program: Option<PathBuf>) -> Self {
        self.keychain_program = program;
        self
    }

    pub fn gate(&self) -> &BackoffGate<B> {
        &self.gate
    }

    fn read_keychain(&self, program: &Path, now: DateTime<Utc>) -> Result<Option<Credentials>, SourceError> {
        let mut command = Command::new(program);
        command.args(["find-generic-password", "-s", KEYCHAIN_SERVICE, "-w"]);
        let output = run_with_timeout(&mut command, KEYCHAIN_TIMEOUT)?;
        let raw = output.stdout.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        parse_credentials(raw, now.timestamp_millis())
    }
}

impl<B: CacheBackend> CredentialSource for SystemCredentials<B> {
    fn keychain(&self, now: DateTime<Utc>) -> Option<Credentials> {
        let program = self.keychain_program.as_ref()?;
        if !self.gate.should_attempt_at(now) {
            return None;
        }
        match self.read_keychain(program, now) {
            Ok(creds) => creds,
            Err(err) => {
                debug!(error = %err, "keychain credential lookup failed");
                self.gate.record_failure_at(now);
                None
            }
        }
    }

    fn file(&self, now: DateTime<Utc>) -> Option<Credentials> {
        let raw = match fs::read_to_string(&self.credentials_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                debug!(path = %self.credentials_path.display(), error = %err, "failed to read credentials");
                return None;
            }
        };
        parse_credentials(&raw, now.timestamp_millis()).unwrap_or_else(|err| {
            debug!(path = %self.credentials_path.display(), error = %err, "invalid credentials file");
            None
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageResponse {
    pub five_hour: Option<UsageWindow>,
    pub seven_day: Option<UsageWindow>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageWindow {
    pub utilization: Option<f64>,
    pub resets_at: Option<String>,
}

pub trait UsageEndpoint {
    fn fetch(&self, access_token: &str) -> Result<UsageResponse, SourceError>;
}

pub struct HttpUsageEndpoint {
    url: String,
    timeout: Duration,
}

impl Default for HttpUsageEndpoint {
    fn default() -> Self {
        Self {
            url: USAGE_URL.to_string(),
            timeout: USAGE_HTTP_TIMEOUT,
        }
    }
}

impl UsageEndpoint for HttpUsageEndpoint {
    fn fetch(&self, access_token: &str) -> Result<UsageResponse, SourceError> {
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let response = agent
            .get(&self.url)
            .set("Authorization", &format!("Bearer {access_token}"))
            .set("anthropic-beta", USAGE_BETA_HEADER)
            .set("User-Agent", USER_AGENT)
            .call()
            .map_err(map_request_error)?;
        if response.status() != 200 {
            return Err(SourceError::Http(response.status()));
        }
        let body = response.into_string().map_err(map_io_error)?;
        serde_json::from_str(&body).map_err(|err| SourceError::Parse(err.to_string()))
    }
}

fn map_request_error(err: ureq::Error) -> SourceError {
    match err {
        ureq::Error::Status(status, _) => SourceError::Http(status),
        ureq::Error::Transport(transport) => {
            let timed_out = transport
                .source()
                .and_then(|source| source.downcast_ref::<io::Error>())
                .is_some_and(|io| matches!(io.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock));
            if timed_out {
                SourceError::RequestTimeout
            } else {
                SourceError::Network(transport.to_string())
            }
        }
    }
}

fn map_io_error(err: io::Error) -> SourceError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => SourceError::RequestTimeout,
        _ => SourceError::Network(err.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageData {
    pub plan_name: String,
    pub five_hour: Option<u8>,
    pub seven_day: Option<u8>,
    pub five_hour_reset_at: Option<DateTime<Utc>>,
    pub seven_day_reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub api_unavailable: bool,
    #[serde(default)]
    pub api_error: Option<String>,
}

impl UsageData {
    pub fn from_response(plan_name: String, response: &UsageResponse) -> Self {
        let window = |w: &Option<UsageWindow>| {
            let w = w.as_ref();
            (
                w.and_then(|w| w.utilization).and_then(clamp_utilization),
                w.and_then(|w| w.resets_at.as_deref()).and_then(parse_reset_time),
            )
        };
        let (five_hour, five_hour_reset_at) = window(&response.five_hour);
        let (seven_day, seven_day_reset_at) = window(&response.seven_day);
        Self {
            plan_name,
            five_hour,
            seven_day,
            five_hour_reset_at,
            seven_day_reset_at,
            api_unavailable: false,
            api_error: None,
        }
    }

    pub fn unavailable(plan_name: String, err: &SourceError) -> Self {
        Self {
            plan_name,
            five_hour: None,
            seven_day: None,
            five_hour_reset_at: None,
            seven_day_reset_at: None,
            api_unavailable: true,
            api_error: Some(err.code()),
        }
    }
}

fn clamp_utilization(value: f64) -> Option<u8> {
    value
        .is_finite()
        .then(|| value.clamp(0.0, 100.0).round() as u8)
}

fn parse_reset_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Failures are cached too, under the shorter failure TTL.
pub struct UsageCache<B = FileBackend> {
    store: CacheStore<UsageData, B>,
}

impl UsageCache {
    pub fn open(path: PathBuf, config: &ApiCacheConfig) -> Self {
        Self::with_backend(FileBackend::new(path), config)
    }
}

impl<B: CacheBackend> UsageCache<B> {
    pub fn with_backend(backend: B, config: &ApiCacheConfig) -> Self {
        let (ttl, failure_ttl) = (config.ttl(), config.failure_ttl());
        let rule = TtlRule::PerValue(Box::new(move |data: &UsageData| {
            if data.api_unavailable { failure_ttl } else { ttl }
        }));
        Self {
            store: CacheStore::new(backend, USAGE_CACHE_VERSION, rule, 1),
        }
    }

    pub fn usage(
        &self,
        credentials: &impl CredentialSource,
        endpoint: &impl UsageEndpoint,
    ) -> Option<UsageData> {
        self.usage_at(credentials, endpoint, Utc::now())
    }

    /// `None` without subscription credentials.
    pub fn usage_at(
        &self,
        credentials: &impl CredentialSource,
        endpoint: &impl UsageEndpoint,
        now: DateTime<Utc>,
    ) -> Option<UsageData> {
        if let Some(cached) = self.store.get_at(USAGE_CACHE_KEY, now) {
            return Some(cached);
        }

        let creds = read_credentials(credentials, now)?;
        let plan = plan_name(&creds.subscription_type)?;

        let data = match endpoint.fetch(&creds.access_token) {
            Ok(response) => UsageData::from_response(plan, &response),
            Err(err) => {
                warn!(error = %err, "usage endpoint unavailable");
                UsageData::unavailable(plan, &err)
            }
        };
        self.store.put_at(USAGE_CACHE_KEY, data.clone(), now);
        Some(data)
    }

    pub fn store(&self) -> &CacheStore<UsageData, B> {
        &self.store
    }
}
