use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::auth::AuthScheme;
use crate::error::{AuthError, Result};

/// spauth - SharePoint authentication helper
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", global = true)]
    pub log_json: bool,

    /// Master key used to encrypt and decrypt secrets
    #[arg(short = 'm', long, env = "SPAUTH_MASTER_KEY", global = true)]
    pub master_key: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Authenticate and print the resulting credential
    Auth(AuthArgs),

    /// Remove cached credentials for a strategy config
    Clean(AuthArgs),

    /// Encrypt a secret for use in a config file
    Encode {
        /// Secret value to encrypt
        value: String,
    },

    /// Decrypt a secret produced by `encode`
    Decode {
        /// Encrypted value
        value: String,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AuthArgs {
    /// Path to a strategy JSON config (takes precedence over the flags below)
    #[arg(short = 'c', long, env = "SPAUTH_CONFIG")]
    pub config: Option<String>,

    /// Strategy name used when no config file is given
    #[arg(short = 's', long, default_value = "adfs")]
    pub strategy: String,

    /// SharePoint site URL
    #[arg(long, env = "SPAUTH_SITE_URL")]
    pub site_url: Option<String>,

    /// User name
    #[arg(short = 'u', long, env = "SPAUTH_USERNAME")]
    pub username: Option<String>,

    /// Password (prompted for when a user name is given without one)
    #[arg(short = 'p', long, env = "SPAUTH_PASSWORD")]
    pub password: Option<String>,

    /// Domain used to qualify the user name
    #[arg(long)]
    pub domain: Option<String>,

    /// ADFS relying party identifier
    #[arg(long)]
    pub relying_party: Option<String>,

    /// ADFS server URL
    #[arg(long)]
    pub adfs_url: Option<String>,

    /// Name of the session cookie issued after ADFS sign-in
    #[arg(long)]
    pub adfs_cookie: Option<String>,

    /// Output format (json, raw)
    #[arg(short = 'o', long, default_value = "raw")]
    pub out_format: String,
}

impl AuthArgs {
    /// Strategy config assembled from flags, in the same shape as a config file
    pub fn config_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        let fields = [
            ("siteUrl", &self.site_url),
            ("username", &self.username),
            ("password", &self.password),
            ("domain", &self.domain),
            ("relyingParty", &self.relying_party),
            ("adfsUrl", &self.adfs_url),
            ("adfsCookie", &self.adfs_cookie),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                map.insert(name.to_string(), value.clone().into());
            }
        }
        map.insert("strategy".to_string(), self.strategy.clone().into());
        serde_json::Value::Object(map)
    }

    /// A user name was given but no password
    pub fn needs_password(&self) -> bool {
        self.config.is_none()
            && self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.password.as_deref().map_or(true, str::is_empty)
    }
}

/// How the CLI prints the acquired credential
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OutputFormat {
    Raw,
    Json,
}

impl OutputFormat {
    /// Render a credential: raw header value, or a JSON object of
    /// cookie names (or `Authorization`) to values
    pub fn render(&self, scheme: AuthScheme, value: &str) -> Result<String> {
        if *self == OutputFormat::Raw {
            return Ok(value.to_string());
        }

        let mut map = serde_json::Map::new();
        match scheme {
            AuthScheme::Bearer => {
                map.insert("Authorization".to_string(), format!("Bearer {}", value).into());
            }
            AuthScheme::Cookie => {
                for pair in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                    let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                    map.insert(name.to_string(), value.to_string().into());
                }
            }
            AuthScheme::None => {}
        }
        Ok(serde_json::to_string(&map)?)
    }
}

/// Status code to retry count mapping for protected-resource calls
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    statuses: HashMap<u16, u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            statuses: HashMap::from([(429, 5), (500, 1), (502, 3), (503, 10), (504, 5)]),
        }
    }
}

impl RetryPolicy {
    /// Maximum retries allowed for a response status (0 when not retryable)
    pub fn retries_for(&self, status: u16) -> u32 {
        self.statuses.get(&status).copied().unwrap_or(0)
    }

    /// Override the retry count for a status
    pub fn with_status(mut self, status: u16, retries: u32) -> Self {
        self.statuses.insert(status, retries);
        self
    }
}

impl FromStr for RetryPolicy {
    type Err = AuthError;

    /// Parse `"429:5,503:10"`
    fn from_str(s: &str) -> Result<Self> {
        let mut statuses = HashMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (status, retries) = pair
                .split_once(':')
                .ok_or_else(|| AuthError::Config(format!("Invalid retry policy entry: {}", pair)))?;
            let status: u16 = status
                .trim()
                .parse()
                .map_err(|_| AuthError::Config(format!("Invalid status in retry policy: {}", pair)))?;
            let retries: u32 = retries
                .trim()
                .parse()
                .map_err(|_| AuthError::Config(format!("Invalid retry count in retry policy: {}", pair)))?;
            statuses.insert(status, retries);
        }
        Ok(Self { statuses })
    }
}

/// Process-wide tunables shared by every strategy and the executor
#[derive(Clone, Debug)]
pub struct AuthSettings {
    // Expiry
    pub expiry_margin_secs: i64,
    pub gateway_cookie_ttl_secs: i64,

    // Timeouts
    pub connect_timeout: u64,
    pub request_timeout: u64,
    pub interactive_timeout: u64,

    // Disk cache
    pub cache_dir: PathBuf,

    // Executor
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_policy: RetryPolicy,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            expiry_margin_secs: 60,
            gateway_cookie_ttl_secs: 3600,
            connect_timeout: 30,
            request_timeout: 120,
            interactive_timeout: 300,
            cache_dir: std::env::temp_dir().join("spauth"),
            max_retries: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 30_000,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl AuthSettings {
    /// Load settings from `SPAUTH_*` environment variables over defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let retry_policy = match std::env::var("SPAUTH_RETRY_POLICIES") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.retry_policy.clone(),
        };

        Ok(Self {
            expiry_margin_secs: env_parse("SPAUTH_EXPIRY_MARGIN_SECS", defaults.expiry_margin_secs)?,
            gateway_cookie_ttl_secs: env_parse(
                "SPAUTH_GATEWAY_COOKIE_TTL",
                defaults.gateway_cookie_ttl_secs,
            )?,
            connect_timeout: env_parse("SPAUTH_CONNECT_TIMEOUT", defaults.connect_timeout)?,
            request_timeout: env_parse("SPAUTH_REQUEST_TIMEOUT", defaults.request_timeout)?,
            interactive_timeout: env_parse(
                "SPAUTH_INTERACTIVE_TIMEOUT",
                defaults.interactive_timeout,
            )?,
            cache_dir: std::env::var("SPAUTH_CACHE_DIR")
                .map(|s| expand_tilde(&s))
                .unwrap_or(defaults.cache_dir),
            max_retries: env_parse("SPAUTH_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay_ms: env_parse(
                "SPAUTH_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            retry_max_delay_ms: env_parse("SPAUTH_RETRY_MAX_DELAY_MS", defaults.retry_max_delay_ms)?,
            retry_policy,
        })
    }

    /// Settings for tests: isolated cache dir, no backoff delays
    pub fn for_testing(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            interactive_timeout: 5,
            ..Self::default()
        }
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AuthError::Config(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

/// Expand tilde (~) in file paths to user's home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse output format from string
pub fn parse_output_format(s: &str) -> Result<OutputFormat> {
    match s.to_lowercase().as_str() {
        "raw" | "" => Ok(OutputFormat::Raw),
        "json" => Ok(OutputFormat::Json),
        other => Err(AuthError::Validation(format!(
            "Unknown output format: {} (expected json or raw)",
            other
        ))),
    }
}
