//! SIP message wrappers and header access

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::Parse(err.to_string())
    }
}

impl From<SipError> for crate::DomainError {
    fn from(err: SipError) -> Self {
        match err {
            SipError::Parse(m) | SipError::InvalidMessage(m) => crate::DomainError::Protocol(m),
            SipError::Authentication(m) => crate::DomainError::AuthFailed(m),
            SipError::Timeout(m) => crate::DomainError::Timeout(m),
            SipError::Transport(m) | SipError::Transaction(m) => crate::DomainError::Transient(m),
            SipError::Internal(m) => crate::DomainError::Internal(m),
        }
    }
}

/// SIP methods the server dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Notify,
    Refer,
    Info,
    Subscribe,
    Update,
    Message,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Refer => "REFER",
            SipMethod::Info => "INFO",
            SipMethod::Subscribe => "SUBSCRIBE",
            SipMethod::Update => "UPDATE",
            SipMethod::Message => "MESSAGE",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Register => Some(SipMethod::Register),
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Bye => Some(SipMethod::Bye),
            Method::Options => Some(SipMethod::Options),
            Method::Notify => Some(SipMethod::Notify),
            Method::Refer => Some(SipMethod::Refer),
            Method::Info => Some(SipMethod::Info),
            Method::Subscribe => Some(SipMethod::Subscribe),
            Method::Update => Some(SipMethod::Update),
            Method::Message => Some(SipMethod::Message),
            _ => None,
        }
    }

    pub fn to_rsip(&self) -> Method {
        match self {
            SipMethod::Register => Method::Register,
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Bye => Method::Bye,
            SipMethod::Options => Method::Options,
            SipMethod::Notify => Method::Notify,
            SipMethod::Refer => Method::Refer,
            SipMethod::Info => Method::Info,
            SipMethod::Subscribe => Method::Subscribe,
            SipMethod::Update => Method::Update,
            SipMethod::Message => Method::Message,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Header value as a bare string. rsip's Display includes the header name,
/// so strip everything up to the first ": ".
pub(crate) fn header_value(header: &Header) -> String {
    let raw = header.to_string();
    match raw.split_once(": ") {
        Some((_, value)) => value.to_string(),
        None => raw,
    }
}

/// Extract the URI part of a name-addr value ("Alice <sip:a@b>;tag=x").
fn uri_part(value: &str) -> String {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].to_string();
        }
    }
    value.split(';').next().unwrap_or(value).trim().to_string()
}

/// Extract a ;name=value parameter from a header value.
fn header_param(value: &str, name: &str) -> Option<String> {
    let needle = format!("{}=", name);
    for part in value.split(';').skip(1) {
        let part = part.trim();
        if let Some(rest) = part.strip_prefix(needle.as_str()) {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

/// Username from a SIP URI ("sip:alice@host:5060" -> "alice").
pub fn uri_user(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("sips:").or_else(|| uri.strip_prefix("sip:"))?;
    rest.split('@').next().filter(|u| !u.is_empty() && *u != rest)
        .map(|u| u.to_string())
}

/// SIP request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn uri(&self) -> &Uri {
        &self.inner.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    fn find_header(&self, pick: fn(&Header) -> bool) -> Option<String> {
        self.inner
            .headers
            .iter()
            .find(|h| pick(h))
            .map(header_value)
    }

    pub fn call_id(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::CallId(_)))
    }

    pub fn from_value(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::From(_)))
    }

    pub fn to_value(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::To(_)))
    }

    pub fn from_uri(&self) -> Option<String> {
        self.from_value().map(|v| uri_part(&v))
    }

    pub fn to_uri(&self) -> Option<String> {
        self.to_value().map(|v| uri_part(&v))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from_value().and_then(|v| header_param(&v, "tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to_value().and_then(|v| header_param(&v, "tag"))
    }

    /// Display name from the From header, if quoted or bare.
    pub fn from_display_name(&self) -> Option<String> {
        let value = self.from_value()?;
        let angle = value.find('<')?;
        let name = value[..angle].trim().trim_matches('"').trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    pub fn cseq(&self) -> Option<(u32, String)> {
        let value = self.find_header(|h| matches!(h, Header::CSeq(_)))?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((seq, method))
    }

    /// Branch parameter of the topmost Via.
    pub fn via_branch(&self) -> Option<String> {
        let value = self.find_header(|h| matches!(h, Header::Via(_)))?;
        header_param(&value, "branch")
    }

    pub fn contact_uri(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::Contact(_)))
            .map(|v| uri_part(&v))
    }

    pub fn expires(&self) -> Option<u32> {
        // the Expires header wins; fall back to the Contact expires param
        if let Some(value) = self.find_header(|h| matches!(h, Header::Expires(_))) {
            if let Ok(expires) = value.trim().parse() {
                return Some(expires);
            }
        }
        self.find_header(|h| matches!(h, Header::Contact(_)))
            .and_then(|v| header_param(&v, "expires"))
            .and_then(|v| v.parse().ok())
    }

    pub fn user_agent(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::UserAgent(_)))
    }

    /// Raw Authorization (or Proxy-Authorization) value.
    pub fn authorization(&self) -> Option<String> {
        self.find_header(|h| {
            matches!(h, Header::Authorization(_) | Header::ProxyAuthorization(_))
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    fn find_header(&self, pick: fn(&Header) -> bool) -> Option<String> {
        self.inner
            .headers
            .iter()
            .find(|h| pick(h))
            .map(header_value)
    }

    pub fn call_id(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::CallId(_)))
    }

    pub fn via_branch(&self) -> Option<String> {
        let value = self.find_header(|h| matches!(h, Header::Via(_)))?;
        header_param(&value, "branch")
    }

    pub fn cseq(&self) -> Option<(u32, String)> {
        let value = self.find_header(|h| matches!(h, Header::CSeq(_)))?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((seq, method))
    }

    pub fn to_value(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::To(_)))
    }

    pub fn from_value(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::From(_)))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to_value().and_then(|v| header_param(&v, "tag"))
    }

    pub fn contact_uri(&self) -> Option<String> {
        self.find_header(|h| matches!(h, Header::Contact(_)))
            .map(|v| uri_part(&v))
    }

    pub fn expires(&self) -> Option<u32> {
        if let Some(value) = self.find_header(|h| matches!(h, Header::Expires(_))) {
            if let Ok(expires) = value.trim().parse() {
                return Some(expires);
            }
        }
        self.find_header(|h| matches!(h, Header::Contact(_)))
            .and_then(|v| header_param(&v, "expires"))
            .and_then(|v| v.parse().ok())
    }

    /// WWW-Authenticate / Proxy-Authenticate challenge value.
    pub fn auth_challenge(&self) -> Option<String> {
        self.inner
            .headers
            .iter()
            .find_map(|h| match h {
                Header::WwwAuthenticate(v) => Some(v.to_string()),
                Header::ProxyAuthenticate(v) => Some(v.to_string()),
                _ => None,
            })
            .map(|raw| match raw.split_once(": ") {
                Some((_, value)) => value.to_string(),
                None => raw,
            })
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// Either a request or a response
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        // requests first; a response line never starts with a method
        if let Ok(request) = SipRequest::parse(data) {
            return Ok(SipMessage::Request(request));
        }
        if let Ok(response) = SipResponse::parse(data) {
            return Ok(SipMessage::Response(response));
        }
        Err(SipError::Parse(
            "not a SIP request or response".to_string(),
        ))
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            SipMessage::Request(req) => req.to_bytes(),
            SipMessage::Response(resp) => resp.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:pbx.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
        From: Alice <sip:alice@pbx.example.com>;tag=1928301774\r\n\
        To: Alice <sip:alice@pbx.example.com>\r\n\
        Call-ID: a84b4c76e66710@pc33.example.com\r\n\
        CSeq: 314159 REGISTER\r\n\
        Contact: <sip:alice@192.168.1.100:5060>\r\n\
        Expires: 3600\r\n\
        User-Agent: Softphone/2.1\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_register() {
        let msg = SipMessage::parse(REGISTER).unwrap();
        let req = match msg {
            SipMessage::Request(req) => req,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(
            req.call_id().as_deref(),
            Some("a84b4c76e66710@pc33.example.com")
        );
        assert_eq!(req.cseq(), Some((314159, "REGISTER".to_string())));
        assert_eq!(req.from_tag().as_deref(), Some("1928301774"));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.via_branch().as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(
            req.contact_uri().as_deref(),
            Some("sip:alice@192.168.1.100:5060")
        );
        assert_eq!(req.expires(), Some(3600));
        assert_eq!(req.from_display_name().as_deref(), Some("Alice"));
        assert_eq!(
            req.from_uri().as_deref(),
            Some("sip:alice@pbx.example.com")
        );
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
            Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bKabc\r\n\
            From: Alice <sip:alice@pbx.example.com>;tag=1928301774\r\n\
            To: Bob <sip:bob@pbx.example.com>;tag=a6c85cf\r\n\
            Call-ID: a84b4c76e66710@pc33.example.com\r\n\
            CSeq: 1 INVITE\r\n\
            Contact: <sip:bob@192.168.1.101:5060>\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = SipMessage::parse(data).unwrap();
        let resp = match msg {
            SipMessage::Response(resp) => resp,
            _ => panic!("expected response"),
        };
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.to_tag().as_deref(), Some("a6c85cf"));
        assert_eq!(resp.via_branch().as_deref(), Some("z9hG4bKabc"));
        assert_eq!(resp.cseq(), Some((1, "INVITE".to_string())));
    }

    #[test]
    fn test_uri_user() {
        assert_eq!(uri_user("sip:alice@example.com"), Some("alice".into()));
        assert_eq!(
            uri_user("sips:bob@10.0.0.1:5061"),
            Some("bob".into())
        );
        assert_eq!(uri_user("sip:example.com"), None);
        assert_eq!(uri_user("mailto:x@y"), None);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(SipMessage::parse(b"\x00\x01\x02 complete garbage").is_err());
    }
}
