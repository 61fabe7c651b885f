// Forms-based authentication web service envelope (SOAP 1.1)

use super::{compact, escape_param, soap_fault, text_at};
use crate::error::{AuthError, Result};

const RESULT_PATH: [&str; 4] = ["Envelope", "Body", "LoginResponse", "LoginResult"];

/// `Login(username, password)` call for `/_vti_bin/authentication.asmx`
pub fn login(username: &str, password: &str) -> String {
    compact(&format!(
        r#"
        <?xml version="1.0" encoding="utf-8"?>
        <soap:Envelope xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema" xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
            <soap:Body>
                <Login xmlns="http://schemas.microsoft.com/sharepoint/soap/">
                    <username>{username}</username>
                    <password>{password}</password>
                </Login>
            </soap:Body>
        </soap:Envelope>
        "#,
        username = escape_param(username),
        password = escape_param(password),
    ))
}

/// Result of a successful `Login` call
#[derive(Debug, Clone, PartialEq)]
pub struct LoginResult {
    pub cookie_name: String,
    pub timeout_seconds: i64,
}

/// Parse the `LoginResponse`; anything but `NoError` is a protocol failure
pub fn parse_response(xml: &str) -> Result<LoginResult> {
    if let Some(fault) = soap_fault(xml)? {
        return Err(AuthError::Protocol(fault));
    }

    let error_code = text_at(xml, &[&RESULT_PATH[..], &["ErrorCode"]].concat())?
        .unwrap_or_default();
    match error_code.as_str() {
        "NoError" => {}
        "PasswordNotMatch" => {
            return Err(AuthError::Protocol("Password doesn't match".to_string()))
        }
        "" => {
            return Err(AuthError::Protocol(
                "FBA response has no LoginResult".to_string(),
            ))
        }
        other => return Err(AuthError::Protocol(other.to_string())),
    }

    let cookie_name = text_at(xml, &[&RESULT_PATH[..], &["CookieName"]].concat())?
        .unwrap_or_default();
    let timeout_seconds = text_at(xml, &[&RESULT_PATH[..], &["TimeoutSeconds"]].concat())?
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);

    Ok(LoginResult {
        cookie_name,
        timeout_seconds,
    })
}
