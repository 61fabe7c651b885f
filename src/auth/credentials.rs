// Strategy config loading, normalization and persistence

use serde::Serialize;
use std::path::{Path, PathBuf};
use url::Url;

use super::StrategyKind;
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;

/// Parse and validate the `siteUrl` of a config
pub fn parse_site_url(site_url: &str) -> Result<Url> {
    if site_url.trim().is_empty() {
        return Err(AuthError::Validation("siteUrl is required".to_string()));
    }
    let url = Url::parse(site_url.trim())
        .map_err(|e| AuthError::Validation(format!("Invalid siteUrl {}: {}", site_url, e)))?;
    if url.host_str().is_none() {
        return Err(AuthError::Validation(format!("siteUrl has no host: {}", site_url)));
    }
    Ok(url)
}

/// `scheme://host[:port]` of a URL
pub fn origin(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Host (with port when present) used to partition caches
pub fn host_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

/// Fail with a validation error when a required field is empty
pub fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AuthError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

/// Qualify `username` with `domain` unless it already carries one (`\` or `@`)
pub fn qualify_username(username: &str, domain: Option<&str>) -> String {
    match domain.filter(|d| !d.is_empty()) {
        Some(domain) if !username.contains('\\') && !username.contains('@') => {
            format!("{}\\{}", domain, username)
        }
        _ => username.to_string(),
    }
}

/// Decrypt a secret field; plaintext values are kept as is
pub fn decode_secret(crypter: &SecretCrypter, value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    crypter.decode_or_plain(value)
}

/// Encrypt a secret field for persistence
pub fn encode_secret(crypter: &SecretCrypter, value: &str) -> Result<String> {
    if value.is_empty() {
        return Ok(String::new());
    }
    crypter.encode(value)
}

/// Read a config file
pub fn read_config_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| AuthError::Config(format!("Cannot read config {}: {}", path.display(), e)))
}

/// Directory of a config file, used to resolve relative paths inside it
pub fn config_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve a path from a config relative to the config's directory
pub fn resolve_relative(dir: Option<&Path>, path: &str) -> PathBuf {
    let candidate = crate::config::expand_tilde(path);
    if candidate.is_absolute() {
        return candidate;
    }
    match dir {
        Some(dir) => dir.join(candidate),
        None => candidate,
    }
}

/// Serialize a config with its `strategy` tag and write it as pretty JSON
pub fn write_config_file<T: Serialize>(path: &Path, kind: StrategyKind, config: &T) -> Result<()> {
    let mut value = serde_json::to_value(config)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "strategy".to_string(),
            serde_json::Value::String(kind.as_str().to_string()),
        );
    }
    let json = serde_json::to_string_pretty(&value)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            AuthError::Config(format!("Cannot create {}: {}", parent.display(), e))
        })?;
    }
    std::fs::write(path, json)
        .map_err(|e| AuthError::Config(format!("Cannot write config {}: {}", path.display(), e)))
}

/// Read the `strategy` property of a config document
pub fn detect_strategy(bytes: &[u8]) -> Result<StrategyKind> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let name = value
        .get("strategy")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::Config("Config has no \"strategy\" property".to_string()))?;
    name.parse()
}
