// ADFS WS-Trust 1.3 envelopes

use super::{attr_at, compact, escape_param, inner_xml_at, soap_fault, text_at};
use crate::error::{AuthError, Result};

const RSTR_PATH: [&str; 4] = [
    "Envelope",
    "Body",
    "RequestSecurityTokenResponseCollection",
    "RequestSecurityTokenResponse",
];

/// SOAP 1.2 RequestSecurityToken for the `usernamemixed` endpoint
pub fn saml_wsfed(to: &str, username: &str, password: &str, relying_party: &str) -> String {
    compact(&format!(
        r#"
        <s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing" xmlns:u="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">
            <s:Header>
                <a:Action s:mustUnderstand="1">http://docs.oasis-open.org/ws-sx/ws-trust/200512/RST/Issue</a:Action>
                <a:ReplyTo>
                    <a:Address>http://www.w3.org/2005/08/addressing/anonymous</a:Address>
                </a:ReplyTo>
                <a:To s:mustUnderstand="1">{to}</a:To>
                <o:Security s:mustUnderstand="1" xmlns:o="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd">
                    <o:UsernameToken u:Id="uuid-{token_id}-1">
                        <o:Username>{username}</o:Username>
                        <o:Password Type="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText">{password}</o:Password>
                    </o:UsernameToken>
                </o:Security>
            </s:Header>
            <s:Body>
                <trust:RequestSecurityToken xmlns:trust="http://docs.oasis-open.org/ws-sx/ws-trust/200512">
                    <wsp:AppliesTo xmlns:wsp="http://schemas.xmlsoap.org/ws/2004/09/policy">
                        <wsa:EndpointReference xmlns:wsa="http://www.w3.org/2005/08/addressing">
                            <wsa:Address>{relying_party}</wsa:Address>
                        </wsa:EndpointReference>
                    </wsp:AppliesTo>
                    <trust:KeyType>http://docs.oasis-open.org/ws-sx/ws-trust/200512/Bearer</trust:KeyType>
                    <trust:RequestType>http://docs.oasis-open.org/ws-sx/ws-trust/200512/Issue</trust:RequestType>
                </trust:RequestSecurityToken>
            </s:Body>
        </s:Envelope>
        "#,
        to = escape_param(to),
        token_id = uuid::Uuid::new_v4(),
        username = escape_param(username),
        password = escape_param(password),
        relying_party = escape_param(relying_party),
    ))
}

/// RSTR wrapper posted as `wresult` to the site's `/_trust/` endpoint
pub fn saml_token(token: &str, not_before: &str, not_on_or_after: &str, relying_party: &str) -> String {
    compact(&format!(
        r#"
        <t:RequestSecurityTokenResponse xmlns:t="http://schemas.xmlsoap.org/ws/2005/02/trust">
            <t:Lifetime>
                <wsu:Created xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">{not_before}</wsu:Created>
                <wsu:Expires xmlns:wsu="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd">{not_on_or_after}</wsu:Expires>
            </t:Lifetime>
            <wsp:AppliesTo xmlns:wsp="http://schemas.xmlsoap.org/ws/2004/09/policy">
                <wsa:EndpointReference xmlns:wsa="http://www.w3.org/2005/08/addressing">
                    <wsa:Address>{relying_party}</wsa:Address>
                </wsa:EndpointReference>
            </wsp:AppliesTo>
            <t:RequestedSecurityToken>{token}</t:RequestedSecurityToken>
            <t:TokenType>urn:oasis:names:tc:SAML:1.0:assertion</t:TokenType>
            <t:RequestType>http://schemas.xmlsoap.org/ws/2005/02/trust/Issue</t:RequestType>
            <t:KeyType>http://schemas.xmlsoap.org/ws/2005/05/identity/NoProofKey</t:KeyType>
        </t:RequestSecurityTokenResponse>
        "#,
        relying_party = escape_param(relying_party),
    ))
}

/// Assertion issued by ADFS together with its validity window
#[derive(Debug, Clone, PartialEq)]
pub struct AdfsAssertion {
    /// Inner XML of `RequestedSecurityToken`
    pub token: String,
    pub not_before: String,
    pub not_on_or_after: String,
}

/// Parse the `usernamemixed` response, failing on a SOAP fault
pub fn parse_response(xml: &str) -> Result<AdfsAssertion> {
    if let Some(fault) = soap_fault(xml)? {
        return Err(AuthError::Protocol(fault));
    }

    let token_path = [&RSTR_PATH[..], &["RequestedSecurityToken"]].concat();
    let token = inner_xml_at(xml, &token_path)?
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| AuthError::Protocol("ADFS response has no RequestedSecurityToken".to_string()))?;

    let conditions = [&token_path[..], &["Assertion", "Conditions"]].concat();
    let lifetime = [&RSTR_PATH[..], &["Lifetime"]].concat();

    let not_before = match attr_at(xml, &conditions, "NotBefore")? {
        Some(v) => v,
        None => text_at(xml, &[&lifetime[..], &["Created"]].concat())?.unwrap_or_default(),
    };
    let not_on_or_after = match attr_at(xml, &conditions, "NotOnOrAfter")? {
        Some(v) => v,
        None => text_at(xml, &[&lifetime[..], &["Expires"]].concat())?.unwrap_or_default(),
    };

    Ok(AdfsAssertion {
        token,
        not_before,
        not_on_or_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><trust:RequestSecurityTokenResponseCollection xmlns:trust="http://docs.oasis-open.org/ws-sx/ws-trust/200512"><trust:RequestSecurityTokenResponse><trust:Lifetime><wsu:Created xmlns:wsu="u">2024-05-01T10:00:00Z</wsu:Created><wsu:Expires xmlns:wsu="u">2024-05-01T11:00:00Z</wsu:Expires></trust:Lifetime><trust:RequestedSecurityToken><saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:1.0:assertion" AssertionID="_a1"><saml:Conditions NotBefore="2024-05-01T10:00:01Z" NotOnOrAfter="2024-05-01T18:00:01Z"/></saml:Assertion></trust:RequestedSecurityToken></trust:RequestSecurityTokenResponse></trust:RequestSecurityTokenResponseCollection></s:Body></s:Envelope>"#;

    #[test]
    fn test_saml_wsfed_escapes_credentials() {
        let body = saml_wsfed(
            "https://adfs.contoso.com/adfs/services/trust/13/usernamemixed",
            "CONTOSO\\john",
            "p<&>ss",
            "urn:sharepoint:contoso",
        );
        assert!(body.starts_with("<s:Envelope"));
        assert!(body.contains("<o:Username>CONTOSO\\john</o:Username>"));
        assert!(body.contains("p&lt;&amp;&gt;ss</o:Password>"));
        assert!(body.contains("<wsa:Address>urn:sharepoint:contoso</wsa:Address>"));
        assert!(!body.contains('\n'));
    }

    #[test]
    fn test_saml_token_embeds_raw_assertion() {
        let rstr = saml_token("<saml:Assertion/>", "a", "b", "urn:rp");
        assert!(rstr.contains("<t:RequestedSecurityToken><saml:Assertion/></t:RequestedSecurityToken>"));
        assert!(rstr.contains(">a</wsu:Created>"));
        assert!(rstr.contains(">b</wsu:Expires>"));
    }

    #[test]
    fn test_parse_response_prefers_conditions() {
        let assertion = parse_response(RESPONSE).unwrap();
        assert!(assertion.token.starts_with("<saml:Assertion"));
        assert_eq!(assertion.not_before, "2024-05-01T10:00:01Z");
        assert_eq!(assertion.not_on_or_after, "2024-05-01T18:00:01Z");
    }

    #[test]
    fn test_parse_response_falls_back_to_lifetime() {
        let xml = RESPONSE.replace(
            r#"<saml:Conditions NotBefore="2024-05-01T10:00:01Z" NotOnOrAfter="2024-05-01T18:00:01Z"/>"#,
            "",
        );
        let assertion = parse_response(&xml).unwrap();
        assert_eq!(assertion.not_before, "2024-05-01T10:00:00Z");
        assert_eq!(assertion.not_on_or_after, "2024-05-01T11:00:00Z");
    }

    #[test]
    fn test_parse_response_fault() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault><s:Reason><s:Text>ID3242: bad password</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;
        match parse_response(xml) {
            Err(AuthError::Protocol(msg)) => assert_eq!(msg, "ID3242: bad password"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_without_token() {
        let xml = r#"<s:Envelope xmlns:s="x"><s:Body/></s:Envelope>"#;
        assert!(matches!(parse_response(xml), Err(AuthError::Protocol(_))));
    }
}
