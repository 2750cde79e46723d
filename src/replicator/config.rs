//! Replicator configuration
//!
//! `ReplicatorConfiguration` is built in code and can carry closures
//! (filters, conflict resolver). `ReplicatorSettings` is the subset that
//! can be loaded from a JSON file and turned into a configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::document::ConflictResolver;

use super::errors::{ReplicationError, ReplicationResult};
use super::filter::ReplicationFilter;

/// Attempts for a one-shot replicator when `max_attempts` is 0
pub const DEFAULT_ONE_SHOT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatorType {
    Push,
    Pull,
    #[default]
    PushAndPull,
}

impl ReplicatorType {
    pub fn pushes(&self) -> bool {
        matches!(self, Self::Push | Self::PushAndPull)
    }

    pub fn pulls(&self) -> bool {
        matches!(self, Self::Pull | Self::PushAndPull)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::PushAndPull => "push_and_pull",
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Authenticator {
    Basic { username: String, password: String },
    Session { session_id: String, cookie_name: String },
    /// Client certificate identity
    Certificate { identity: String },
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Session { cookie_name, .. } => f
                .debug_struct("Session")
                .field("session_id", &"<redacted>")
                .field("cookie_name", cookie_name)
                .finish(),
            Self::Certificate { identity } => f.debug_struct("Certificate").field("identity", identity).finish(),
        }
    }
}

/// A validated `ws://` or `wss://` URL
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint(String);

fn endpoint_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^wss?://[A-Za-z0-9](?:[A-Za-z0-9.\-]*[A-Za-z0-9])?(?::[0-9]{1,5})?(?:/[^\s?#]*)?$")
            .expect("endpoint pattern is valid")
    })
}

impl Endpoint {
    pub fn parse(url: &str) -> ReplicationResult<Self> {
        if !endpoint_pattern().is_match(url) {
            return Err(ReplicationError::configuration_error(format!(
                "invalid endpoint {:?}: expected ws:// or wss:// URL",
                url
            )));
        }
        Ok(Self(url.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_secure(&self) -> bool {
        self.0.starts_with("wss://")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = ReplicationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&s)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

#[derive(Clone)]
pub struct ReplicatorConfiguration {
    pub database: Database,
    pub endpoint: Endpoint,
    pub replicator_type: ReplicatorType,
    pub continuous: bool,
    pub authenticator: Option<Authenticator>,
    pub pinned_server_certificate: Option<Vec<u8>>,
    pub headers: BTreeMap<String, String>,
    pub channels: Vec<String>,
    pub document_ids: Vec<String>,
    pub push_filter: Option<Arc<dyn ReplicationFilter>>,
    pub pull_filter: Option<Arc<dyn ReplicationFilter>>,
    /// `None` uses the default resolver
    pub conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    /// 0 means 10 for one-shot and unlimited for continuous
    pub max_attempts: u32,
    pub max_attempt_wait_time: Duration,
    pub heartbeat: Duration,
    pub batch_size: usize,
    /// When false, pulled documents purged by expiration are pulled again
    pub disable_auto_purge: bool,
    pub stop_grace_period: Duration,
}

impl fmt::Debug for ReplicatorConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatorConfiguration")
            .field("database", &self.database.name())
            .field("endpoint", &self.endpoint)
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("authenticator", &self.authenticator)
            .field("channels", &self.channels)
            .field("document_ids", &self.document_ids)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl ReplicatorConfiguration {
    pub fn new(database: Database, endpoint: Endpoint) -> Self {
        Self {
            database,
            endpoint,
            replicator_type: ReplicatorType::default(),
            continuous: false,
            authenticator: None,
            pinned_server_certificate: None,
            headers: BTreeMap::new(),
            channels: Vec::new(),
            document_ids: Vec::new(),
            push_filter: None,
            pull_filter: None,
            conflict_resolver: None,
            max_attempts: 0,
            max_attempt_wait_time: Duration::from_secs(default_max_attempt_wait_secs()),
            heartbeat: Duration::from_secs(default_heartbeat_secs()),
            batch_size: default_batch_size(),
            disable_auto_purge: false,
            stop_grace_period: Duration::from_millis(default_stop_grace_ms()),
        }
    }

    pub fn replicator_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn pinned_server_certificate(mut self, certificate: Vec<u8>) -> Self {
        self.pinned_server_certificate = Some(certificate);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn document_ids(mut self, document_ids: Vec<String>) -> Self {
        self.document_ids = document_ids;
        self
    }

    pub fn push_filter(mut self, filter: impl ReplicationFilter + 'static) -> Self {
        self.push_filter = Some(Arc::new(filter));
        self
    }

    pub fn pull_filter(mut self, filter: impl ReplicationFilter + 'static) -> Self {
        self.pull_filter = Some(Arc::new(filter));
        self
    }

    pub fn conflict_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.conflict_resolver = Some(Arc::new(resolver));
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn max_attempt_wait_time(mut self, wait: Duration) -> Self {
        self.max_attempt_wait_time = wait;
        self
    }

    pub fn heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn disable_auto_purge(mut self, disable: bool) -> Self {
        self.disable_auto_purge = disable;
        self
    }

    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    /// Attempts allowed before giving up
    pub fn effective_max_attempts(&self) -> u32 {
        match (self.max_attempts, self.continuous) {
            (0, false) => DEFAULT_ONE_SHOT_ATTEMPTS,
            (0, true) => u32::MAX,
            (n, _) => n,
        }
    }

    pub fn validate(&self) -> ReplicationResult<()> {
        if self.batch_size == 0 {
            return Err(ReplicationError::configuration_error("batch_size must be > 0"));
        }
        if self.heartbeat.is_zero() {
            return Err(ReplicationError::configuration_error("heartbeat must be > 0"));
        }
        if self.max_attempt_wait_time.is_zero() {
            return Err(ReplicationError::configuration_error("max_attempt_wait_time must be > 0"));
        }
        if self.pinned_server_certificate.is_some() && !self.endpoint.is_secure() {
            return Err(ReplicationError::configuration_error(
                "a pinned certificate requires a wss:// endpoint",
            ));
        }
        if let Some(Authenticator::Basic { username, .. }) = &self.authenticator {
            if username.is_empty() {
                return Err(ReplicationError::configuration_error("username must not be empty"));
            }
        }
        if self.database.is_closed() {
            return Err(ReplicationError::configuration_error("database is closed"));
        }
        Ok(())
    }
}

/// File-loadable replicator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorSettings {
    pub endpoint: Endpoint,

    #[serde(default)]
    pub replicator_type: ReplicatorType,

    #[serde(default)]
    pub continuous: bool,

    #[serde(default)]
    pub authenticator: Option<Authenticator>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default)]
    pub document_ids: Vec<String>,

    /// 0 means 10 for one-shot and unlimited for continuous
    #[serde(default)]
    pub max_attempts: u32,

    /// Backoff cap in seconds (default: 300)
    #[serde(default = "default_max_attempt_wait_secs")]
    pub max_attempt_wait_time_secs: u64,

    /// Idle poll interval in seconds (default: 300)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default)]
    pub disable_auto_purge: bool,

    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_period_ms: u64,
}

fn default_max_attempt_wait_secs() -> u64 {
    300
}

fn default_heartbeat_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    100
}

fn default_stop_grace_ms() -> u64 {
    5000
}

impl ReplicatorSettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> ReplicationResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ReplicationError::configuration_error(format!("Failed to read config: {}", e)))?;
        let settings: ReplicatorSettings = serde_json::from_str(&content)
            .map_err(|e| ReplicationError::configuration_error(format!("Invalid config JSON: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> ReplicationResult<()> {
        if self.batch_size == 0 {
            return Err(ReplicationError::configuration_error("batch_size must be > 0"));
        }
        if self.heartbeat_secs == 0 {
            return Err(ReplicationError::configuration_error("heartbeat_secs must be > 0"));
        }
        if self.max_attempt_wait_time_secs == 0 {
            return Err(ReplicationError::configuration_error(
                "max_attempt_wait_time_secs must be > 0",
            ));
        }
        Ok(())
    }

    /// Full configuration for `database`
    pub fn into_configuration(self, database: Database) -> ReplicatorConfiguration {
        let mut config = ReplicatorConfiguration::new(database, self.endpoint)
            .replicator_type(self.replicator_type)
            .continuous(self.continuous)
            .channels(self.channels)
            .document_ids(self.document_ids)
            .max_attempts(self.max_attempts)
            .max_attempt_wait_time(Duration::from_secs(self.max_attempt_wait_time_secs))
            .heartbeat(Duration::from_secs(self.heartbeat_secs))
            .batch_size(self.batch_size)
            .disable_auto_purge(self.disable_auto_purge)
            .stop_grace_period(Duration::from_millis(self.stop_grace_period_ms));
        config.authenticator = self.authenticator;
        config.headers = self.headers;
        config
    }
}
