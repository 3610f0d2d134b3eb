//! Cloudflare Access configuration.
//!
//! Configuration is loaded from environment variables. The audience tag and
//! team name are required; their absence is a startup error, never a
//! per-request one.

use crate::auth::jwt::MAX_CLOCK_SKEW;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default domain under which Cloudflare Access team hosts live.
pub const DEFAULT_TEAM_DOMAIN: &str = "cloudflareaccess.com";

/// Default timeout for calls to the Access broker.
pub const DEFAULT_HTTP_TIMEOUT_SECONDS: u64 = 10;

/// Upper bound for the broker call timeout.
pub const MAX_HTTP_TIMEOUT_SECONDS: u64 = 120;

/// Path of the signing key set on the team host.
pub const CERTS_PATH: &str = "/cdn-cgi/access/certs";

/// Path of the identity endpoint on the team host.
pub const IDENTITY_PATH: &str = "/cdn-cgi/access/get-identity";

/// Cloudflare Access configuration for one application.
///
/// Fields are only set through the validating constructors and builders.
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Application audience tag, matched against the token's `aud` claim.
    audience: String,

    /// Zero Trust team name (the `{team}` in `{team}.cloudflareaccess.com`).
    team: String,

    /// Base URL of the team host, without trailing slash.
    team_url: String,

    /// Clock skew tolerance in seconds for `exp`, `nbf` and `iat` checks.
    clock_skew_seconds: u64,

    /// Timeout in seconds applied to key set and identity fetches.
    http_timeout_seconds: u64,

    /// Whether the `iss` claim must equal the team URL.
    verify_issuer: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid team name: {0}")]
    InvalidTeam(String),

    #[error("Invalid team URL: {0}")]
    InvalidTeamUrl(String),

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidClockSkew(String),

    #[error("Invalid HTTP timeout configuration: {0}")]
    InvalidHttpTimeout(String),

    #[error("Invalid issuer verification flag: {0}")]
    InvalidVerifyIssuer(String),
}

impl AccessConfig {
    /// Create a configuration for `audience` and `team` with defaults for
    /// everything else.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if either value is empty and
    /// `ConfigError::InvalidTeam` if the team is not a valid host label.
    pub fn new(audience: impl Into<String>, team: impl Into<String>) -> Result<Self, ConfigError> {
        let audience = audience.into();
        let team = team.into();

        if audience.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar(
                "CLOUDFLARE_ACCESS_AUD".to_string(),
            ));
        }
        if team.trim().is_empty() {
            return Err(ConfigError::MissingEnvVar(
                "CLOUDFLARE_ACCESS_TEAM".to_string(),
            ));
        }
        validate_team(&team)?;

        let team_url = format!("https://{}.{}", team, DEFAULT_TEAM_DOMAIN);

        Ok(Self {
            audience,
            team,
            team_url,
            clock_skew_seconds: 0,
            http_timeout_seconds: DEFAULT_HTTP_TIMEOUT_SECONDS,
            verify_issuer: true,
        })
    }

    /// Point the configuration at a different team host.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidTeamUrl` unless the URL is a bare http(s)
    /// origin.
    pub fn with_team_url(mut self, team_url: &str) -> Result<Self, ConfigError> {
        self.team_url = normalize_team_url(team_url)?;
        Ok(self)
    }

    /// Set the clock skew tolerance.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidClockSkew` above the 10 minute cap.
    pub fn with_clock_skew(mut self, skew: Duration) -> Result<Self, ConfigError> {
        if skew > MAX_CLOCK_SKEW {
            return Err(ConfigError::InvalidClockSkew(format!(
                "clock skew must not exceed {} seconds, got {}",
                MAX_CLOCK_SKEW.as_secs(),
                skew.as_secs()
            )));
        }
        self.clock_skew_seconds = skew.as_secs();
        Ok(self)
    }

    /// Set the timeout for key set and identity fetches.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidHttpTimeout` outside 1 to 120 seconds.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        self.http_timeout_seconds = validate_http_timeout(timeout.as_secs())?;
        Ok(self)
    }

    /// Enable or disable `iss` verification.
    pub fn with_verify_issuer(mut self, verify_issuer: bool) -> Self {
        self.verify_issuer = verify_issuer;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let audience = required(vars, "CLOUDFLARE_ACCESS_AUD")?;
        let team = required(vars, "CLOUDFLARE_ACCESS_TEAM")?;
        validate_team(&team)?;

        let team_domain = vars
            .get("CLOUDFLARE_ACCESS_TEAM_DOMAIN")
            .map(|d| d.trim().trim_matches('.').to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| DEFAULT_TEAM_DOMAIN.to_string());

        let team_url = match vars.get("CLOUDFLARE_ACCESS_TEAM_URL") {
            Some(url) => normalize_team_url(url)?,
            None => normalize_team_url(&format!("https://{}.{}", team, team_domain))?,
        };

        // Parse JWT clock skew tolerance with validation
        let clock_skew_seconds =
            if let Some(value_str) = vars.get("CLOUDFLARE_ACCESS_CLOCK_SKEW_SECONDS") {
                let value: u64 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidClockSkew(format!(
                        "CLOUDFLARE_ACCESS_CLOCK_SKEW_SECONDS must be a non-negative integer, got '{}': {}",
                        value_str, e
                    ))
                })?;

                if value > MAX_CLOCK_SKEW.as_secs() {
                    return Err(ConfigError::InvalidClockSkew(format!(
                        "CLOUDFLARE_ACCESS_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                        MAX_CLOCK_SKEW.as_secs(),
                        value
                    )));
                }

                value
            } else {
                0
            };

        let http_timeout_seconds =
            if let Some(value_str) = vars.get("CLOUDFLARE_ACCESS_HTTP_TIMEOUT_SECONDS") {
                let value: u64 = value_str.parse().map_err(|e| {
                    ConfigError::InvalidHttpTimeout(format!(
                        "CLOUDFLARE_ACCESS_HTTP_TIMEOUT_SECONDS must be a valid positive integer, got '{}': {}",
                        value_str, e
                    ))
                })?;

                validate_http_timeout(value)?
            } else {
                DEFAULT_HTTP_TIMEOUT_SECONDS
            };

        let verify_issuer = match vars.get("CLOUDFLARE_ACCESS_VERIFY_ISSUER") {
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                other => {
                    return Err(ConfigError::InvalidVerifyIssuer(format!(
                        "CLOUDFLARE_ACCESS_VERIFY_ISSUER must be true or false, got '{}'",
                        other
                    )))
                }
            },
            None => true,
        };

        Ok(AccessConfig {
            audience,
            team,
            team_url,
            clock_skew_seconds,
            http_timeout_seconds,
            verify_issuer,
        })
    }

    /// URL of the team's signing key set.
    pub fn certs_url(&self) -> String {
        format!("{}{}", self.team_url, CERTS_PATH)
    }

    /// URL of the team's identity endpoint.
    pub fn identity_url(&self) -> String {
        format!("{}{}", self.team_url, IDENTITY_PATH)
    }

    /// Expected `iss` claim for tokens minted for this team.
    pub fn issuer(&self) -> &str {
        &self.team_url
    }

    /// Application audience tag, matched against the token's `aud` claim.
    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn team(&self) -> &str {
        &self.team
    }

    /// Base URL of the team host, without trailing slash.
    pub fn team_url(&self) -> &str {
        &self.team_url
    }

    /// Whether the `iss` claim must equal the team URL.
    pub fn verify_issuer(&self) -> bool {
        self.verify_issuer
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

fn required(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    vars.get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
}

/// Team names end up in a hostname, so only a single DNS label is accepted.
fn validate_team(team: &str) -> Result<(), ConfigError> {
    let valid = !team.is_empty()
        && team.len() <= 63
        && !team.starts_with('-')
        && !team.ends_with('-')
        && team.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidTeam(format!(
            "team must be a single host label of letters, digits and '-', got '{}'",
            team
        )))
    }
}

fn validate_http_timeout(seconds: u64) -> Result<u64, ConfigError> {
    if seconds == 0 || seconds > MAX_HTTP_TIMEOUT_SECONDS {
        return Err(ConfigError::InvalidHttpTimeout(format!(
            "HTTP timeout must be between 1 and {} seconds, got {}",
            MAX_HTTP_TIMEOUT_SECONDS, seconds
        )));
    }
    Ok(seconds)
}

/// Broker paths are appended to the team URL, so only a bare origin is
/// accepted: no path, query, fragment or credentials.
fn normalize_team_url(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    let url = Url::parse(raw).map_err(|e| {
        ConfigError::InvalidTeamUrl(format!("'{}' is not a valid URL: {}", raw, e))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidTeamUrl(format!(
            "team URL must use http or https, got '{}'",
            raw
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ConfigError::InvalidTeamUrl(format!(
            "team URL is missing a host: '{}'",
            raw
        )));
    }
    if url.path() != "/"
        || url.query().is_some()
        || url.fragment().is_some()
        || !url.username().is_empty()
        || url.password().is_some()
    {
        return Err(ConfigError::InvalidTeamUrl(format!(
            "team URL must be a bare origin without path, query or fragment, got '{}'",
            raw
        )));
    }

    Ok(url.origin().ascii_serialization())
}
