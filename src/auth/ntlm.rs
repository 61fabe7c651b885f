//! NTLM authentication (Windows Integrated Auth)
//!
//! No credential is fetched ahead of time. `set_auth` switches the request
//! onto the negotiating transport, which runs the handshake per request:
//! 1. Client sends a Type 1 (Negotiate) message
//! 2. Server answers 401 with a Type 2 (Challenge) message carrying a nonce
//! 3. Client resends with a Type 3 (Authenticate) NTLMv2 response

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use reqwest::header::{HeaderMap, HeaderValue, WWW_AUTHENTICATE};
use reqwest::Request;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use super::credentials;
use super::types::{cache_key, AuthScheme, AuthToken};
use super::{AuthContext, CredentialStrategy, StrategyKind, Transport};
use crate::error::{AuthError, Result};
use crate::secret::SecretCrypter;

const NEGOTIATE_UNICODE: u32 = 0x00000001;
const NEGOTIATE_OEM: u32 = 0x00000002;
const REQUEST_TARGET: u32 = 0x00000004;
const NEGOTIATE_NTLM: u32 = 0x00000200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x00008000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x00080000;
const NEGOTIATE_TARGET_INFO: u32 = 0x00800000;
const NEGOTIATE_128: u32 = 0x20000000;
const NEGOTIATE_56: u32 = 0x80000000;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

/// Windows FILETIME epoch offset from UNIX epoch, in 100ns ticks
const FILETIME_EPOCH_DIFF: u64 = 116_444_736_000_000_000;

/// Basic-auth shaped credentials consumed by the negotiating transport
#[derive(Clone, PartialEq)]
pub struct NtlmCredentials {
    username: String,
    password: String,
    domain: Option<String>,
    workstation: Option<String>,
}

impl fmt::Debug for NtlmCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmCredentials")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .finish_non_exhaustive()
    }
}

/// Parsed Type 2 (Challenge) message
#[derive(Debug)]
pub struct Type2Message {
    pub server_challenge: [u8; 8],
    pub flags: u32,
    pub target_name: Option<String>,
    /// AV_PAIRs echoed into the NTLMv2 blob
    pub target_info: Option<Vec<u8>>,
}

impl NtlmCredentials {
    /// Username may be `user`, `DOMAIN\user` or `user@domain`
    pub fn new(username: &str, password: impl Into<String>) -> Self {
        let (user, domain) = if let Some((domain, user)) = username.split_once('\\') {
            (user.to_string(), Some(domain.to_string()))
        } else if let Some((user, domain)) = username.split_once('@') {
            (user.to_string(), Some(domain.to_string()))
        } else {
            (username.to_string(), None)
        };

        Self {
            username: user,
            password: password.into(),
            domain,
            workstation: None,
        }
    }

    pub fn with_workstation(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.workstation = (!name.is_empty()).then_some(name);
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// `Authorization` value opening the handshake
    pub fn negotiate_header(&self) -> Result<HeaderValue> {
        header_value(&negotiate_message())
    }

    /// `Authorization` value answering the challenge of a 401 response
    pub fn authenticate_header(&self, challenge: &HeaderMap) -> Result<HeaderValue> {
        let type2 = extract_type2_from_header(challenge)?;
        header_value(&self.authenticate_message(&type2)?)
    }

    fn authenticate_message(&self, type2: &Type2Message) -> Result<Vec<u8>> {
        use rand::RngCore;

        let mut client_challenge = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut client_challenge);

        let (nt_response, lm_response) = self.ntlmv2_response(
            &type2.server_challenge,
            &client_challenge,
            type2.target_info.as_deref(),
        )?;

        let domain = to_utf16le(self.domain.as_deref().unwrap_or(""));
        let username = to_utf16le(&self.username);
        let workstation = to_utf16le(self.workstation.as_deref().unwrap_or(""));

        // Fixed header is 64 bytes; payloads follow in this order
        let payloads: [&[u8]; 5] = [&lm_response, &nt_response, &domain, &username, &workstation];

        let mut msg = Vec::with_capacity(64 + payloads.iter().map(|p| p.len()).sum::<usize>());
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&3u32.to_le_bytes());

        let mut offset: u32 = 64;
        for payload in payloads {
            push_security_buffer(&mut msg, payload.len(), offset);
            offset += payload.len() as u32;
        }
        // Empty session key
        push_security_buffer(&mut msg, 0, offset);
        msg.extend_from_slice(&type2.flags.to_le_bytes());

        for payload in payloads {
            msg.extend_from_slice(payload);
        }
        Ok(msg)
    }

    fn ntlmv2_response(
        &self,
        server_challenge: &[u8; 8],
        client_challenge: &[u8; 8],
        target_info: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        use hmac::{Hmac, Mac};
        use md4::{Digest, Md4};
        use md5_digest::Md5;

        type HmacMd5 = Hmac<Md5>;

        let nt_hash = Md4::digest(to_utf16le(&self.password));

        let identity = format!(
            "{}{}",
            self.username.to_uppercase(),
            self.domain.as_deref().unwrap_or("")
        );
        let mut mac = <HmacMd5 as Mac>::new_from_slice(&nt_hash)
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("HMAC error: {}", e)))?;
        mac.update(&to_utf16le(&identity));
        let ntlmv2_hash = mac.finalize().into_bytes();

        let mut blob = Vec::with_capacity(32 + target_info.map(<[u8]>::len).unwrap_or(0));
        blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
        blob.extend_from_slice(&[0x00; 4]);
        blob.extend_from_slice(&filetime());
        blob.extend_from_slice(client_challenge);
        blob.extend_from_slice(&[0x00; 4]);
        if let Some(info) = target_info {
            blob.extend_from_slice(info);
        }
        blob.extend_from_slice(&[0x00; 4]);

        let mut mac = <HmacMd5 as Mac>::new_from_slice(&ntlmv2_hash)
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("HMAC error: {}", e)))?;
        mac.update(server_challenge);
        mac.update(&blob);
        let mut nt_response = mac.finalize().into_bytes().to_vec();
        nt_response.extend_from_slice(&blob);

        let mut mac = <HmacMd5 as Mac>::new_from_slice(&ntlmv2_hash)
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("HMAC error: {}", e)))?;
        mac.update(server_challenge);
        mac.update(client_challenge);
        let mut lm_response = mac.finalize().into_bytes().to_vec();
        lm_response.extend_from_slice(client_challenge);

        Ok((nt_response, lm_response))
    }
}

fn negotiate_message() -> Vec<u8> {
    let flags: u32 = NEGOTIATE_UNICODE
        | NEGOTIATE_OEM
        | REQUEST_TARGET
        | NEGOTIATE_NTLM
        | NEGOTIATE_ALWAYS_SIGN
        | NEGOTIATE_EXTENDED_SESSIONSECURITY
        | NEGOTIATE_TARGET_INFO
        | NEGOTIATE_128
        | NEGOTIATE_56;

    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    // Empty domain and workstation buffers
    push_security_buffer(&mut msg, 0, 0);
    push_security_buffer(&mut msg, 0, 0);
    msg
}

fn push_security_buffer(msg: &mut Vec<u8>, len: usize, offset: u32) {
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&(len as u16).to_le_bytes());
    msg.extend_from_slice(&offset.to_le_bytes());
}

fn header_value(msg: &[u8]) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!("NTLM {}", STANDARD.encode(msg)))
        .map_err(|e| AuthError::Protocol(format!("Invalid NTLM header: {}", e)))
}

fn to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn filetime() -> [u8; 8] {
    let now = Utc::now();
    let ticks = (now.timestamp().max(0) as u64) * 10_000_000
        + u64::from(now.timestamp_subsec_nanos()) / 100
        + FILETIME_EPOCH_DIFF;
    ticks.to_le_bytes()
}

fn read_u16(data: &[u8], at: usize) -> usize {
    u16::from_le_bytes([data[at], data[at + 1]]) as usize
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Parse a Type 2 (Challenge) message
pub fn parse_type2_message(data: &[u8]) -> Result<Type2Message> {
    if data.len() < 32 {
        return Err(AuthError::Protocol("NTLM challenge too short".to_string()));
    }
    if &data[0..8] != SIGNATURE {
        return Err(AuthError::Protocol("Invalid NTLM signature".to_string()));
    }
    let msg_type = read_u32(data, 8);
    if msg_type != 2 {
        return Err(AuthError::Protocol(format!(
            "Expected NTLM Type 2 message, got Type {}",
            msg_type
        )));
    }

    let flags = read_u32(data, 20);
    let mut server_challenge = [0u8; 8];
    server_challenge.copy_from_slice(&data[24..32]);

    let slice = |len: usize, offset: usize| {
        (len > 0 && offset + len <= data.len()).then(|| &data[offset..offset + len])
    };

    let target_name = slice(read_u16(data, 12), read_u32(data, 16) as usize).map(|bytes| {
        let units: Vec<u16> = bytes
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
            .collect();
        String::from_utf16_lossy(&units)
    });

    let target_info = if data.len() >= 48 && flags & NEGOTIATE_TARGET_INFO != 0 {
        slice(read_u16(data, 40), read_u32(data, 44) as usize).map(<[u8]>::to_vec)
    } else {
        None
    };

    Ok(Type2Message {
        server_challenge,
        flags,
        target_name,
        target_info,
    })
}

/// Find the NTLM challenge among the `WWW-Authenticate` headers of a 401
pub fn extract_type2_from_header(headers: &HeaderMap) -> Result<Type2Message> {
    let token = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| {
            v.strip_prefix("NTLM ")
                .or_else(|| v.strip_prefix("Negotiate "))
                .map(str::trim)
        })
        .ok_or_else(|| AuthError::Protocol("Server sent no NTLM challenge".to_string()))?;

    let decoded = STANDARD
        .decode(token)
        .map_err(|e| AuthError::Protocol(format!("Invalid NTLM challenge encoding: {}", e)))?;
    parse_type2_message(&decoded)
}

/// NTLM strategy config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NtlmConfig {
    pub site_url: String,
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workstation: Option<String>,
}

pub struct NtlmStrategy {
    ctx: AuthContext,
    config: NtlmConfig,
    crypter: SecretCrypter,
}

impl NtlmStrategy {
    pub fn new(ctx: AuthContext) -> Self {
        Self {
            ctx,
            config: NtlmConfig::default(),
            crypter: SecretCrypter::new(None),
        }
    }

    pub fn with_config(ctx: AuthContext, config: NtlmConfig) -> Self {
        let mut strategy = Self::new(ctx);
        strategy.config = config;
        strategy.config.username = credentials::qualify_username(
            &strategy.config.username,
            strategy.config.domain.as_deref(),
        );
        strategy
    }

    pub fn config(&self) -> &NtlmConfig {
        &self.config
    }

    /// Credentials handed to the negotiating transport
    pub fn credentials(&self) -> NtlmCredentials {
        NtlmCredentials::new(&self.config.username, self.config.password.clone())
            .with_workstation(self.config.workstation.clone().unwrap_or_default())
    }
}

#[async_trait]
impl CredentialStrategy for NtlmStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Ntlm
    }

    fn site_url(&self) -> &str {
        &self.config.site_url
    }

    fn context(&self) -> &AuthContext {
        &self.ctx
    }

    fn set_master_key(&mut self, key: &str) {
        self.crypter = SecretCrypter::new(Some(key));
    }

    fn parse_config(&mut self, bytes: &[u8]) -> Result<()> {
        let mut config: NtlmConfig = serde_json::from_slice(bytes)?;
        config.password = credentials::decode_secret(&self.crypter, &config.password);
        config.username = credentials::qualify_username(&config.username, config.domain.as_deref());
        self.config = config;
        Ok(())
    }

    fn write_config(&self, path: &Path) -> Result<()> {
        let mut config = self.config.clone();
        config.password = credentials::encode_secret(&self.crypter, &config.password)?;
        credentials::write_config_file(path, self.kind(), &config)
    }

    fn cache_key(&self) -> Result<String> {
        let site = credentials::parse_site_url(&self.config.site_url)?;
        Ok(cache_key(
            &credentials::host_key(&site),
            self.strategy(),
            &[&self.config.username, &self.config.password],
        ))
    }

    fn scheme(&self) -> AuthScheme {
        AuthScheme::None
    }

    /// The handshake is per request, so there is no token to hand out
    async fn get_auth(&self) -> Result<AuthToken> {
        Ok(AuthToken::new(String::new(), Utc::now() + Duration::hours(1)))
    }

    async fn set_auth(&self, _request: &mut Request, transport: &mut Transport) -> Result<()> {
        credentials::require("username", &self.config.username)?;
        *transport = Transport::Ntlm(self.credentials());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::AUTHORIZATION;

    fn challenge(flags: u32, target_info: &[u8]) -> Vec<u8> {
        let mut msg = vec![0u8; 48];
        msg[0..8].copy_from_slice(SIGNATURE);
        msg[8..12].copy_from_slice(&2u32.to_le_bytes());
        msg[20..24].copy_from_slice(&flags.to_le_bytes());
        msg[24..32].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        msg[40..42].copy_from_slice(&(target_info.len() as u16).to_le_bytes());
        msg[44..48].copy_from_slice(&48u32.to_le_bytes());
        msg.extend_from_slice(target_info);
        msg
    }

    #[test]
    fn test_credentials_split_domain() {
        let creds = NtlmCredentials::new("CONTOSO\\john", "p");
        assert_eq!(creds.username(), "john");
        assert_eq!(creds.domain(), Some("CONTOSO"));

        let creds = NtlmCredentials::new("john@contoso.com", "p");
        assert_eq!(creds.username(), "john");
        assert_eq!(creds.domain(), Some("contoso.com"));

        let creds = NtlmCredentials::new("john", "p");
        assert_eq!(creds.domain(), None);
    }

    #[test]
    fn test_debug_hides_password() {
        let creds = NtlmCredentials::new("john", "hunter2");
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_negotiate_header() {
        let value = NtlmCredentials::new("john", "p").negotiate_header().unwrap();
        let value = value.to_str().unwrap();
        let decoded = STANDARD.decode(value.strip_prefix("NTLM ").unwrap()).unwrap();
        assert_eq!(&decoded[0..8], SIGNATURE);
        assert_eq!(read_u32(&decoded, 8), 1);
    }

    #[test]
    fn test_parse_type2_with_target_info() {
        let info = [2u8, 0, 2, 0, b'D', 0, 0, 0, 0, 0];
        let parsed = parse_type2_message(&challenge(NEGOTIATE_UNICODE | NEGOTIATE_TARGET_INFO, &info)).unwrap();
        assert_eq!(parsed.server_challenge, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(parsed.target_info.as_deref(), Some(&info[..]));
        assert!(parsed.target_name.is_none());
    }

    #[test]
    fn test_parse_type2_rejects_garbage() {
        assert!(parse_type2_message(b"short").is_err());
        let mut msg = challenge(NEGOTIATE_UNICODE, &[]);
        msg[8] = 3;
        assert!(parse_type2_message(&msg).is_err());
    }

    #[test]
    fn test_authenticate_header_layout() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static("Negotiate"));
        headers.append(
            WWW_AUTHENTICATE,
            HeaderValue::from_str(&format!("NTLM {}", STANDARD.encode(challenge(NEGOTIATE_UNICODE, &[])))).unwrap(),
        );

        let creds = NtlmCredentials::new("CONTOSO\\john", "p").with_workstation("WS");
        let value = creds.authenticate_header(&headers).unwrap();
        let msg = STANDARD
            .decode(value.to_str().unwrap().strip_prefix("NTLM ").unwrap())
            .unwrap();

        assert_eq!(read_u32(&msg, 8), 3);
        // LMv2 response is always 24 bytes at offset 64
        assert_eq!(read_u16(&msg, 12), 24);
        assert_eq!(read_u32(&msg, 16), 64);
        // Username buffer decodes back to the bare user
        let len = read_u16(&msg, 36);
        let offset = read_u32(&msg, 40) as usize;
        assert_eq!(&msg[offset..offset + len], &to_utf16le("john")[..]);
    }

    #[tokio::test]
    async fn test_set_auth_switches_transport_only() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AuthContext::new(crate::config::AuthSettings::for_testing(dir.path().into())).unwrap();
        let strategy = NtlmStrategy::with_config(
            ctx,
            NtlmConfig {
                site_url: "http://sp.contoso.local".to_string(),
                username: "john".to_string(),
                password: "p".to_string(),
                domain: Some("CONTOSO".to_string()),
                workstation: None,
            },
        );

        let mut request = Request::new(reqwest::Method::GET, "http://sp.contoso.local/_api/web".parse().unwrap());
        let mut transport = Transport::Direct;
        strategy.set_auth(&mut request, &mut transport).await.unwrap();

        assert!(request.headers().get(AUTHORIZATION).is_none());
        match transport {
            Transport::Ntlm(creds) => {
                assert_eq!(creds.username(), "john");
                assert_eq!(creds.domain(), Some("CONTOSO"));
            }
            Transport::Direct => panic!("transport not switched"),
        }
    }
}
