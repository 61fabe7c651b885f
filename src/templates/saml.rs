// SharePoint Online WS-Trust 2005 envelopes

use super::{compact, escape_param, soap_fault, text_at};
use crate::error::{AuthError, Result};

const RSTR_PATH: [&str; 3] = ["Envelope", "Body", "RequestSecurityTokenResponse"];

/// RequestSecurityToken for the online security token service (`extSTS.srf`)
pub fn online_saml_wsfed(sts_url: &str, endpoint: &str, username: &str, password: &str) -> String {
    compact(&format!(
        r#"
        <s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing" xmlns:u="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">
            <s:Header>
                <a:Action s:mustUnderstand="1">http://schemas.xmlsoap.org/ws/2005/02/trust/RST/Issue</a:Action>
                <a:ReplyTo>
                    <a:Address>http://www.w3.org/2005/08/addressing/anonymous</a:Address>
                </a:ReplyTo>
                <a:To s:mustUnderstand="1">{sts_url}</a:To>
                <o:Security s:mustUnderstand="1" xmlns:o="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
                    <o:UsernameToken>
                        <o:Username>{username}</o:Username>
                        <o:Password>{password}</o:Password>
                    </o:UsernameToken>
                </o:Security>
            </s:Header>
            <s:Body>
                <t:RequestSecurityToken xmlns:t="http://schemas.xmlsoap.org/ws/2005/02/trust">
                    <wsp:AppliesTo xmlns:wsp="http://schemas.xmlsoap.org/ws/2004/09/policy">
                        <a:EndpointReference>
                            <a:Address>{endpoint}</a:Address>
                        </a:EndpointReference>
                    </wsp:AppliesTo>
                    <t:KeyType>http://schemas.xmlsoap.org/ws/2005/05/identity/NoProofKey</t:KeyType>
                    <t:RequestType>http://schemas.xmlsoap.org/ws/2005/02/trust/Issue</t:RequestType>
                    <t:TokenType>urn:oasis:names:tc:SAML:1.0:assertion</t:TokenType>
                </t:RequestSecurityToken>
            </s:Body>
        </s:Envelope>
        "#,
        sts_url = escape_param(sts_url),
        endpoint = escape_param(endpoint),
        username = escape_param(username),
        password = escape_param(password),
    ))
}

/// Binary security token returned by the online STS
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryToken {
    pub token: String,
    pub expires: String,
}

/// Parse the STS response, failing on a fault or a missing token
pub fn parse_response(xml: &str) -> Result<BinaryToken> {
    if let Some(fault) = soap_fault(xml)? {
        return Err(AuthError::Protocol(fault));
    }

    let token = text_at(
        xml,
        &[&RSTR_PATH[..], &["RequestedSecurityToken", "BinarySecurityToken"]].concat(),
    )?
    .filter(|t| !t.is_empty())
    .ok_or_else(|| AuthError::Protocol("Can't extract binary security token".to_string()))?;

    let expires =
        text_at(xml, &[&RSTR_PATH[..], &["Lifetime", "Expires"]].concat())?.unwrap_or_default();

    Ok(BinaryToken { token, expires })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_online_saml_wsfed() {
        let body = online_saml_wsfed(
            "https://login.microsoftonline.com/extSTS.srf",
            "https://contoso.sharepoint.com/_forms/default.aspx?wa=wsignin1.0",
            "john@contoso.com",
            "secret",
        );
        assert!(body.contains("<a:To s:mustUnderstand=\"1\">https://login.microsoftonline.com/extSTS.srf</a:To>"));
        assert!(body.contains("default.aspx?wa=wsignin1.0</a:Address>"));
        assert!(body.contains("<o:Username>john@contoso.com</o:Username>"));
    }

    #[test]
    fn test_parse_response() {
        let xml = r#"<S:Envelope xmlns:S="http://www.w3.org/2003/05/soap-envelope"><S:Body><wst:RequestSecurityTokenResponse xmlns:wst="http://schemas.xmlsoap.org/ws/2005/02/trust"><wst:Lifetime><wsu:Created xmlns:wsu="u">2024-05-01T10:00:00Z</wsu:Created><wsu:Expires xmlns:wsu="u">2024-05-02T10:00:00Z</wsu:Expires></wst:Lifetime><wst:RequestedSecurityToken><wsse:BinarySecurityToken xmlns:wsse="s" Id="Compact0">t=EwBgAk6hB&amp;p=</wsse:BinarySecurityToken></wst:RequestedSecurityToken></wst:RequestSecurityTokenResponse></S:Body></S:Envelope>"#;
        let token = parse_response(xml).unwrap();
        assert_eq!(token.token, "t=EwBgAk6hB&p=");
        assert_eq!(token.expires, "2024-05-02T10:00:00Z");
    }

    #[test]
    fn test_parse_response_fault() {
        let xml = r#"<S:Envelope xmlns:S="http://www.w3.org/2003/05/soap-envelope"><S:Body><S:Fault><S:Reason><S:Text>Authentication Failure</S:Text></S:Reason></S:Fault></S:Body></S:Envelope>"#;
        assert!(matches!(parse_response(xml), Err(AuthError::Protocol(m)) if m == "Authentication Failure"));
    }
}
