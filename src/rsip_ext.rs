//! Small lenient helpers over the rsip message model.
//!
//! Real devices ship Contact headers rsip's strict grammar rejects
//! (feature tags like `+sip.instance="<urn:uuid:...>"`), and responses
//! carry routing hints in Via params. Everything here is tolerant by
//! design: bad input degrades to "no information", not an error, except
//! where a URI is genuinely unrecoverable.

use crate::transport::SipAddr;
use crate::{Error, Result};
use nom::{
    bytes::complete::take_until,
    character::complete::{char, multispace0},
    combinator::opt,
    sequence::delimited,
    IResult,
};
use rsip::prelude::{HeadersExt, ToTypedHeader};

pub trait RsipResponseExt {
    /// `received`/`rport`-corrected source of the response, from the
    /// topmost Via. Registrars use this to tell a NAT'ed client its
    /// public address.
    fn via_received(&self) -> Option<rsip::HostWithPort>;
}

impl RsipResponseExt for rsip::Response {
    fn via_received(&self) -> Option<rsip::HostWithPort> {
        let via = self.via_header().ok()?;
        crate::transport::SipConnection::parse_target_from_via(via).ok()
    }
}

/// Extract the URI of a Contact header value, tolerating non-standard
/// parameters that make the strict parser fail.
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    if let Ok(uri) = rsip::headers::Contact::from(line).uri() {
        return Ok(uri);
    }

    let raw = match bracketed_uri(line.trim()) {
        Ok((_, uri)) => uri,
        // no angle brackets: strip header params after the URI
        Err(_) => line
            .trim()
            .split_once(';')
            .map_or(line.trim(), |(uri, _)| uri),
    };

    let mut uri = rsip::Uri::try_from(raw.trim()).map_err(Error::from)?;
    uri.headers.clear();
    Ok(uri)
}

fn bracketed_uri(input: &str) -> IResult<&str, &str> {
    let (input, _) = multispace0(input)?;
    let (input, _) = opt(take_until("<"))(input)?;
    let (input, uri) = delimited(char('<'), take_until(">"), char('>'))(input)?;
    Ok((input, uri.trim()))
}

/// Next-hop address of an out-of-dialog request: the first Route header
/// if present, else the request URI.
pub fn destination_from_request(request: &rsip::Request) -> Option<SipAddr> {
    request
        .headers
        .iter()
        .find_map(|header| match header {
            rsip::Header::Route(route) => route
                .typed()
                .ok()
                .and_then(|r| r.uris().first().and_then(|u| SipAddr::try_from(&u.uri).ok())),
            _ => None,
        })
        .or_else(|| SipAddr::try_from(&request.uri).ok())
}

#[cfg(test)]
mod tests {
    use super::extract_uri_from_contact;

    #[test]
    fn test_extract_uri_from_contact() {
        let line = "<sip:bob@localhost;transport=udp>;expires=3600;+org.linphone.specs=\"lime\"";
        let uri = extract_uri_from_contact(line).expect("failed to parse contact");
        assert_eq!(uri.host_with_port.to_string(), "localhost");

        let line = "<sip:bob@example.com:5080>;message-expires=2419200;+sip.instance=\"<urn:uuid:12345-81fa-4fe3-aa6c-17bffdbcf619>\"";
        let uri = extract_uri_from_contact(line).expect("failed to parse contact");
        assert_eq!(uri.to_string(), "sip:bob@example.com:5080");

        let line = "sip:carol@10.0.0.2:5062;ob";
        let uri = extract_uri_from_contact(line).expect("failed to parse contact");
        assert_eq!(uri.host_with_port.to_string(), "10.0.0.2:5062");
    }
}
