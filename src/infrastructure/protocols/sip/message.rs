//! SIP message types and header accessors

use bytes::Bytes;
use rsip::prelude::*;
use rsip::{Header, Headers, Method, Request, Response, Uri};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error("Transaction timed out: {0}")]
    Timeout(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}

/// Methods the gateway distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Message,
    Info,
    Notify,
    Subscribe,
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
            SipMethod::Message => "MESSAGE",
            SipMethod::Info => "INFO",
            SipMethod::Notify => "NOTIFY",
            SipMethod::Subscribe => "SUBSCRIBE",
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
            Method::Message => Some(SipMethod::Message),
            Method::Info => Some(SipMethod::Info),
            Method::Notify => Some(SipMethod::Notify),
            Method::Subscribe => Some(SipMethod::Subscribe),
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
            SipMethod::Message => Method::Message,
            SipMethod::Info => Method::Info,
            SipMethod::Notify => Method::Notify,
            SipMethod::Subscribe => Method::Subscribe,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Value of the `tag` parameter in a From/To header value.
pub fn tag_param(header_value: &str) -> Option<String> {
    param(header_value, "tag")
}

/// Address of a name-addr header value: `"cam" <sip:a@b>;tag=1` -> `sip:a@b`.
pub fn header_uri(header_value: &str) -> &str {
    match (header_value.find('<'), header_value.find('>')) {
        (Some(start), Some(end)) if start < end => header_value[start + 1..end].trim(),
        _ => header_value.split(';').next().unwrap_or(header_value).trim(),
    }
}

/// Value of a `;name=value` parameter, ignoring anything inside `<...>`.
pub fn param(header_value: &str, name: &str) -> Option<String> {
    let params = match header_value.rfind('>') {
        Some(idx) => &header_value[idx + 1..],
        None => header_value,
    };
    params.split(';').skip(1).find_map(|p| {
        let (key, value) = p.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

fn header_values<'a>(headers: &'a Headers, name: &'a str) -> impl Iterator<Item = String> + 'a {
    headers.iter().filter_map(move |h| {
        let (n, v) = match h {
            Header::Via(v) => ("via", v.value().to_string()),
            Header::From(v) => ("from", v.value().to_string()),
            Header::To(v) => ("to", v.value().to_string()),
            Header::CallId(v) => ("call-id", v.value().to_string()),
            Header::CSeq(v) => ("cseq", v.value().to_string()),
            Header::Contact(v) => ("contact", v.value().to_string()),
            Header::ContentType(v) => ("content-type", v.value().to_string()),
            Header::Expires(v) => ("expires", v.value().to_string()),
            Header::Authorization(v) => ("authorization", v.value().to_string()),
            Header::Other(n, v) => return n.eq_ignore_ascii_case(name).then(|| v.clone()),
            _ => return None,
        };
        n.eq_ignore_ascii_case(name).then_some(v)
    })
}

/// Header accessors shared by requests and responses.
pub trait HeaderAccess {
    fn header_list(&self) -> &Headers;

    /// First value of a header by (case-insensitive) name.
    fn header(&self, name: &str) -> Option<String> {
        header_values(self.header_list(), name).next()
    }

    fn headers_named(&self, name: &str) -> Vec<String> {
        header_values(self.header_list(), name).collect()
    }

    fn call_id(&self) -> Option<String> {
        self.header("call-id").map(|v| v.trim().to_string())
    }

    fn from_header(&self) -> Option<String> {
        self.header("from")
    }

    fn to_header(&self) -> Option<String> {
        self.header("to")
    }

    fn from_tag(&self) -> Option<String> {
        self.from_header().as_deref().and_then(tag_param)
    }

    fn to_tag(&self) -> Option<String> {
        self.to_header().as_deref().and_then(tag_param)
    }

    /// Top Via value
    fn via(&self) -> Option<String> {
        self.header("via")
    }

    fn branch(&self) -> Option<String> {
        self.via().as_deref().and_then(|v| param(v, "branch"))
    }

    /// `(number, method)` from CSeq
    fn cseq(&self) -> Option<(u32, String)> {
        let value = self.header("cseq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((seq, method))
    }

    fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|v| v.trim().to_string())
    }
}

/// SIP Request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn method_name(&self) -> String {
        self.inner.method.to_string()
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

    pub fn expires(&self) -> Option<u64> {
        self.header("expires").and_then(|v| v.trim().parse().ok())
    }

    /// Every Authorization header value
    pub fn authorizations(&self) -> Vec<String> {
        self.headers_named("authorization")
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipRequest {
    fn header_list(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code() < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

impl HeaderAccess for SipResponse {
    fn header_list(&self) -> &Headers {
        &self.inner.headers
    }
}

/// SIP Message (either request or response)
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.starts_with(b"SIP/") {
            return SipResponse::parse(data).map(SipMessage::Response);
        }
        SipRequest::parse(data).map(SipMessage::Request)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, SipMessage::Response(_))
    }

    pub fn as_request(&self) -> Option<&SipRequest> {
        match self {
            SipMessage::Request(req) => Some(req),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&SipResponse> {
        match self {
            SipMessage::Response(resp) => Some(resp),
            _ => None,
        }
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

    const REGISTER: &[u8] = b"REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK776asdhds\r\n\
        From: <sip:34020000001320000001@3402000000>;tag=1928301774\r\n\
        To: <sip:34020000001320000001@3402000000>\r\n\
        Call-ID: a84b4c76e66710@192.168.1.64\r\n\
        CSeq: 1 REGISTER\r\n\
        Contact: <sip:34020000001320000001@192.168.1.64:5060>\r\n\
        Max-Forwards: 70\r\n\
        Expires: 3600\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_register_request() {
        let msg = SipMessage::parse(REGISTER).unwrap();
        let req = msg.as_request().unwrap();
        assert_eq!(req.method(), Some(SipMethod::Register));
        assert_eq!(req.call_id().as_deref(), Some("a84b4c76e66710@192.168.1.64"));
        assert_eq!(req.cseq(), Some((1, "REGISTER".to_string())));
        assert_eq!(req.from_tag().as_deref(), Some("1928301774"));
        assert_eq!(req.to_tag(), None);
        assert_eq!(req.branch().as_deref(), Some("z9hG4bK776asdhds"));
        assert_eq!(req.expires(), Some(3600));
        assert!(req.authorizations().is_empty());
    }

    #[test]
    fn test_header_uri() {
        assert_eq!(header_uri("\"Cam\" <sip:3402@10.0.0.1:5060>;tag=9"), "sip:3402@10.0.0.1:5060");
        assert_eq!(header_uri("sip:3402@3402000000;tag=9"), "sip:3402@3402000000");
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
                     Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-1\r\n\
                     From: <sip:34020000002000000001@3402000000>;tag=abc\r\n\
                     To: <sip:34020000001320000001@3402000000>;tag=def\r\n\
                     Call-ID: call-1\r\n\
                     CSeq: 7 INVITE\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::parse(data).unwrap();
        let resp = msg.as_response().unwrap();
        assert_eq!(resp.status_code(), 200);
        assert!(resp.is_success());
        assert_eq!(resp.to_tag().as_deref(), Some("def"));
        assert_eq!(resp.cseq(), Some((7, "INVITE".to_string())));
    }

    #[test]
    fn test_param_ignores_uri_params() {
        let value = "<sip:a@h;tag=inner>;tag=outer";
        assert_eq!(tag_param(value).as_deref(), Some("outer"));
        assert_eq!(param("SIP/2.0/UDP h:5060;branch=z9;rport", "branch").as_deref(), Some("z9"));
    }
}
