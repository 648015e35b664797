//! SIP message construction

use rand::Rng;
use rsip::{Header, Headers, Method, Request, Response, StatusCode, Uri, Version};

use super::message::{SipError, SipMethod, SipRequest, SipResponse};

/// RFC 3261 magic cookie prefixing every branch id
pub const BRANCH_COOKIE: &str = "z9hG4bK";

pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    let random: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    format!("{}{}", BRANCH_COOKIE, hex::encode(random))
}

pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    let random: Vec<u8> = (0..6).map(|_| rng.gen()).collect();
    hex::encode(random)
}

pub fn generate_call_id(domain: &str) -> String {
    let mut rng = rand::thread_rng();
    let random: Vec<u8> = (0..12).map(|_| rng.gen()).collect();
    format!("{}@{}", hex::encode(random), domain)
}

/// Build a response for a received request, copying the dialog headers.
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
    to_tag: Option<String>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
            to_tag: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn trying() -> Self {
        Self::new(100)
    }

    pub fn ringing() -> Self {
        Self::new(180)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    pub fn not_implemented() -> Self {
        Self::new(501)
    }

    pub fn service_unavailable() -> Self {
        Self::new(503)
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .push(Header::ContentType(content_type.into()));
        self.body = body;
        self
    }

    /// Add a tag to the copied To header (dialog-establishing responses).
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.to_tag = Some(tag.to_string());
        self
    }

    pub fn build_for_request(mut self, request: &SipRequest) -> Result<SipResponse, SipError> {
        for header in request.headers().iter() {
            match header {
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_) => {
                    self.headers.push(header.clone());
                }
                Header::To(to) => {
                    let value = super::message::header_value(&Header::To(to.clone()));
                    match &self.to_tag {
                        Some(tag) if !value.contains(";tag=") => {
                            self.headers
                                .push(Header::To(format!("{};tag={}", value, tag).into()));
                        }
                        _ => self.headers.push(header.clone()),
                    }
                }
                _ => {}
            }
        }

        self.headers.push(Header::ContentLength(
            self.body.len().to_string().into(),
        ));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(self.headers),
            body: self.body,
            version: Version::V2,
        };
        Ok(SipResponse::new(response))
    }
}

/// Build an outgoing request from scratch.
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: &str) -> Self {
        Self {
            method,
            uri: uri.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn via(mut self, local_addr: &str, transport: &str, branch: &str) -> Self {
        self.headers.push(Header::Via(
            format!("SIP/2.0/{} {};branch={}", transport, local_addr, branch).into(),
        ));
        self
    }

    pub fn from(mut self, display: Option<&str>, uri: &str, tag: &str) -> Self {
        let value = match display {
            Some(name) => format!("\"{}\" <{}>;tag={}", name, uri, tag),
            None => format!("<{}>;tag={}", uri, tag),
        };
        self.headers.push(Header::From(value.into()));
        self
    }

    pub fn to(mut self, uri: &str, tag: Option<&str>) -> Self {
        let value = match tag {
            Some(tag) => format!("<{}>;tag={}", uri, tag),
            None => format!("<{}>", uri),
        };
        self.headers.push(Header::To(value.into()));
        self
    }

    pub fn call_id(mut self, call_id: &str) -> Self {
        self.headers.push(Header::CallId(call_id.into()));
        self
    }

    pub fn cseq(mut self, seq: u32, method: SipMethod) -> Self {
        self.headers
            .push(Header::CSeq(format!("{} {}", seq, method).into()));
        self
    }

    pub fn contact(mut self, uri: &str) -> Self {
        self.headers
            .push(Header::Contact(format!("<{}>", uri).into()));
        self
    }

    pub fn expires(mut self, seconds: u32) -> Self {
        self.headers
            .push(Header::Expires(seconds.to_string().into()));
        self
    }

    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.headers
            .push(Header::MaxForwards(hops.to_string().into()));
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.headers
            .push(Header::ContentType(content_type.into()));
        self.body = body;
        self
    }

    pub fn build(mut self) -> Result<SipRequest, SipError> {
        let uri = Uri::try_from(self.uri.as_str())
            .map_err(|e| SipError::InvalidMessage(format!("bad uri {}: {}", self.uri, e)))?;
        self.headers.push(Header::ContentLength(
            self.body.len().to_string().into(),
        ));
        let request = Request {
            method: self.method.to_rsip(),
            uri,
            headers: Headers::from(self.headers),
            version: Version::V2,
            body: self.body,
        };
        Ok(SipRequest::new(request))
    }
}

/// An ACK for a 2xx response, sent directly to the peer's contact.
pub fn build_ack(
    original: &SipRequest,
    response: &SipResponse,
    local_addr: &str,
    transport: &str,
) -> Result<SipRequest, SipError> {
    let target = response
        .contact_uri()
        .or_else(|| original.to_uri())
        .ok_or_else(|| SipError::InvalidMessage("no target for ACK".into()))?;
    let (seq, _) = original
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("original request has no CSeq".into()))?;
    let call_id = original
        .call_id()
        .ok_or_else(|| SipError::InvalidMessage("original request has no Call-ID".into()))?;
    let from = original
        .from_value()
        .ok_or_else(|| SipError::InvalidMessage("original request has no From".into()))?;
    let to = response
        .to_value()
        .ok_or_else(|| SipError::InvalidMessage("response has no To".into()))?;

    let mut builder = RequestBuilder::new(SipMethod::Ack, &target)
        .via(local_addr, transport, &generate_branch())
        .call_id(&call_id)
        .cseq(seq, SipMethod::Ack)
        .max_forwards(70);
    builder = builder
        .header(Header::From(from.into()))
        .header(Header::To(to.into()));
    builder.build()
}

/// An in-dialog BYE following an answered INVITE.
pub fn build_bye(
    original: &SipRequest,
    response: &SipResponse,
    local_addr: &str,
    transport: &str,
) -> Result<SipRequest, SipError> {
    let target = response
        .contact_uri()
        .or_else(|| original.to_uri())
        .ok_or_else(|| SipError::InvalidMessage("no target for BYE".into()))?;
    let (seq, _) = original
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("original request has no CSeq".into()))?;
    let call_id = original
        .call_id()
        .ok_or_else(|| SipError::InvalidMessage("original request has no Call-ID".into()))?;
    let from = original
        .from_value()
        .ok_or_else(|| SipError::InvalidMessage("original request has no From".into()))?;
    let to = response
        .to_value()
        .ok_or_else(|| SipError::InvalidMessage("response has no To".into()))?;

    RequestBuilder::new(SipMethod::Bye, &target)
        .via(local_addr, transport, &generate_branch())
        .call_id(&call_id)
        .cseq(seq + 1, SipMethod::Bye)
        .max_forwards(70)
        .header(Header::From(from.into()))
        .header(Header::To(to.into()))
        .build()
}

/// A CANCEL for a pending INVITE: same branch, Call-ID and CSeq number.
pub fn build_cancel(invite: &SipRequest, local_addr: &str, transport: &str) -> Result<SipRequest, SipError> {
    let branch = invite
        .via_branch()
        .ok_or_else(|| SipError::InvalidMessage("INVITE has no branch".into()))?;
    let (seq, _) = invite
        .cseq()
        .ok_or_else(|| SipError::InvalidMessage("INVITE has no CSeq".into()))?;
    let call_id = invite
        .call_id()
        .ok_or_else(|| SipError::InvalidMessage("INVITE has no Call-ID".into()))?;
    let from = invite
        .from_value()
        .ok_or_else(|| SipError::InvalidMessage("INVITE has no From".into()))?;
    let to = invite
        .to_value()
        .ok_or_else(|| SipError::InvalidMessage("INVITE has no To".into()))?;

    RequestBuilder::new(SipMethod::Cancel, &invite.uri().to_string())
        .via(local_addr, transport, &branch)
        .call_id(&call_id)
        .cseq(seq, SipMethod::Cancel)
        .max_forwards(70)
        .header(Header::From(from.into()))
        .header(Header::To(to.into()))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_request() -> SipRequest {
        SipRequest::parse(
            b"REGISTER sip:pbx.example.com SIP/2.0\r\n\
              Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKtest\r\n\
              From: <sip:alice@pbx.example.com>;tag=ft\r\n\
              To: <sip:alice@pbx.example.com>\r\n\
              Call-ID: cid@host\r\n\
              CSeq: 2 REGISTER\r\n\
              Content-Length: 0\r\n\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_branch_has_cookie_and_is_unique() {
        let a = generate_branch();
        let b = generate_branch();
        assert!(a.starts_with(BRANCH_COOKIE));
        assert_ne!(a, b);
    }

    #[test]
    fn test_response_copies_dialog_headers() {
        let response = ResponseBuilder::ok()
            .build_for_request(&register_request())
            .unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.call_id().as_deref(), Some("cid@host"));
        assert_eq!(response.via_branch().as_deref(), Some("z9hG4bKtest"));
    }

    #[test]
    fn test_response_to_tag_added_once() {
        let response = ResponseBuilder::ok()
            .to_tag("tt1")
            .build_for_request(&register_request())
            .unwrap();
        assert_eq!(response.to_tag().as_deref(), Some("tt1"));
    }

    #[test]
    fn test_request_builder_roundtrip() {
        let request = RequestBuilder::new(SipMethod::Invite, "sip:201@10.0.0.5:5060")
            .via("10.0.0.1:5060", "UDP", &generate_branch())
            .from(Some("Reception"), "sip:100@10.0.0.1", "abc")
            .to("sip:201@10.0.0.5", None)
            .call_id("cid2@pbx")
            .cseq(1, SipMethod::Invite)
            .contact("sip:pbx@10.0.0.1:5060")
            .max_forwards(70)
            .build()
            .unwrap();

        // it must survive its own serialisation
        let wire = request.to_bytes();
        let parsed = SipRequest::parse(&wire).unwrap();
        assert_eq!(parsed.method(), Some(SipMethod::Invite));
        assert_eq!(parsed.call_id().as_deref(), Some("cid2@pbx"));
        assert_eq!(parsed.cseq(), Some((1, "INVITE".to_string())));
        assert_eq!(parsed.from_tag().as_deref(), Some("abc"));
    }

    #[test]
    fn test_cancel_reuses_branch_and_seq() {
        let invite = RequestBuilder::new(SipMethod::Invite, "sip:201@10.0.0.5")
            .via("10.0.0.1:5060", "UDP", "z9hG4bKinv1")
            .from(None, "sip:100@10.0.0.1", "abc")
            .to("sip:201@10.0.0.5", None)
            .call_id("cid3@pbx")
            .cseq(7, SipMethod::Invite)
            .build()
            .unwrap();

        let cancel = build_cancel(&invite, "10.0.0.1:5060", "UDP").unwrap();
        assert_eq!(cancel.method(), Some(SipMethod::Cancel));
        assert_eq!(cancel.via_branch().as_deref(), Some("z9hG4bKinv1"));
        assert_eq!(cancel.cseq(), Some((7, "CANCEL".to_string())));
        assert_eq!(cancel.call_id().as_deref(), Some("cid3@pbx"));
    }
}
