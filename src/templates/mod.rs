// SOAP / WS-Trust envelope builders and XML extraction helpers

pub mod adfs;
pub mod fba;
pub mod saml;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{AuthError, Result};

/// Escape a value interpolated into an XML envelope
pub fn escape_param(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Trim every line and join them, dropping blank lines
pub fn compact(s: &str) -> String {
    s.lines().map(str::trim).filter(|l| !l.is_empty()).collect()
}

fn xml_err(e: quick_xml::Error) -> AuthError {
    AuthError::Protocol(format!("Malformed XML response: {}", e))
}

/// Walk `xml` until the element at `path` (local names from the root) starts
fn locate<'i, T>(
    xml: &'i str,
    path: &[&str],
    mut on_match: impl FnMut(&mut Reader<&'i [u8]>, &BytesStart<'i>, bool) -> Result<T>,
) -> Result<Option<T>> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(e) => {
                stack.push(e.local_name().as_ref().to_vec());
                if on_path(&stack, path) {
                    return on_match(&mut reader, &e, false).map(Some);
                }
            }
            Event::Empty(e) => {
                stack.push(e.local_name().as_ref().to_vec());
                if on_path(&stack, path) {
                    return on_match(&mut reader, &e, true).map(Some);
                }
                stack.pop();
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn on_path(stack: &[Vec<u8>], path: &[&str]) -> bool {
    stack.len() == path.len()
        && stack
            .iter()
            .zip(path)
            .all(|(seen, want)| seen.as_slice() == want.as_bytes())
}

/// Unescaped text content of the element at `path`
pub fn text_at(xml: &str, path: &[&str]) -> Result<Option<String>> {
    locate(xml, path, |reader, start, empty| {
        if empty {
            return Ok(String::new());
        }
        let raw = reader.read_text(start.name()).map_err(xml_err)?;
        quick_xml::escape::unescape(&raw)
            .map(|s| s.trim().to_string())
            .map_err(|e| AuthError::Protocol(format!("Malformed XML text: {}", e)))
    })
}

/// Raw inner markup of the element at `path`
pub fn inner_xml_at(xml: &str, path: &[&str]) -> Result<Option<String>> {
    locate(xml, path, |reader, start, empty| {
        if empty {
            return Ok(String::new());
        }
        Ok(reader.read_text(start.name()).map_err(xml_err)?.into_owned())
    })
}

/// Attribute value (by local name) of the element at `path`
pub fn attr_at(xml: &str, path: &[&str], attr: &str) -> Result<Option<String>> {
    let found = locate(xml, path, |_, start, _| {
        for a in start.attributes().flatten() {
            if a.key.local_name().as_ref() == attr.as_bytes() {
                let value = a
                    .unescape_value()
                    .map_err(|e| AuthError::Protocol(format!("Malformed XML attribute: {}", e)))?;
                return Ok(Some(value.into_owned()));
            }
        }
        Ok(None)
    })?;
    Ok(found.flatten())
}

/// SOAP fault message, for both SOAP 1.2 (`Reason/Text`) and 1.1 (`faultstring`)
pub fn soap_fault(xml: &str) -> Result<Option<String>> {
    if let Some(text) = text_at(xml, &["Envelope", "Body", "Fault", "Reason", "Text"])? {
        return Ok(Some(text));
    }
    text_at(xml, &["Envelope", "Body", "Fault", "faultstring"])
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<s:Envelope xmlns:s="urn:s"><s:Body><a:Item xmlns:a="urn:a" a:When="2024-01-01T00:00:00Z" plain="x &amp; y"><a:Value>1 &lt; 2</a:Value><a:Nested><b/></a:Nested></a:Item><Empty/></s:Body></s:Envelope>"#;

    #[test]
    fn test_escape_param() {
        assert_eq!(
            escape_param(r#"a&b"c'd<e>f"#),
            "a&amp;b&quot;c&apos;d&lt;e&gt;f"
        );
        assert_eq!(escape_param("plain"), "plain");
    }

    #[test]
    fn test_compact() {
        assert_eq!(compact("\n   <a>\n\n      <b/>\n   </a>\n"), "<a><b/></a>");
    }

    #[test]
    fn test_text_at() {
        assert_eq!(
            text_at(SAMPLE, &["Envelope", "Body", "Item", "Value"]).unwrap().as_deref(),
            Some("1 < 2")
        );
        assert_eq!(
            text_at(SAMPLE, &["Envelope", "Body", "Empty"]).unwrap().as_deref(),
            Some("")
        );
        assert!(text_at(SAMPLE, &["Envelope", "Body", "Missing"]).unwrap().is_none());
    }

    #[test]
    fn test_path_is_anchored_at_root() {
        assert!(text_at(SAMPLE, &["Body", "Item", "Value"]).unwrap().is_none());
    }

    #[test]
    fn test_inner_xml_at() {
        assert_eq!(
            inner_xml_at(SAMPLE, &["Envelope", "Body", "Item", "Nested"]).unwrap().as_deref(),
            Some("<b/>")
        );
    }

    #[test]
    fn test_attr_at() {
        assert_eq!(
            attr_at(SAMPLE, &["Envelope", "Body", "Item"], "When").unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(
            attr_at(SAMPLE, &["Envelope", "Body", "Item"], "plain").unwrap().as_deref(),
            Some("x & y")
        );
        assert!(attr_at(SAMPLE, &["Envelope", "Body", "Item"], "none").unwrap().is_none());
    }

    #[test]
    fn test_soap_fault() {
        let fault12 = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault><s:Code><s:Value>s:Sender</s:Value></s:Code><s:Reason><s:Text xml:lang="en-US">ID3242: The security token could not be authenticated or authorized.</s:Text></s:Reason></s:Fault></s:Body></s:Envelope>"#;
        assert_eq!(
            soap_fault(fault12).unwrap().as_deref(),
            Some("ID3242: The security token could not be authenticated or authorized.")
        );

        let fault11 = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>Server was unable to process request.</faultstring></soap:Fault></soap:Body></soap:Envelope>"#;
        assert_eq!(
            soap_fault(fault11).unwrap().as_deref(),
            Some("Server was unable to process request.")
        );

        assert!(soap_fault(SAMPLE).unwrap().is_none());
    }

    #[test]
    fn test_malformed_xml_is_protocol_error() {
        let err = text_at("<a><b>text", &["a", "b"]).unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)));
    }
}
