//! SIP message builder utilities

use super::message::{HeaderAccess, SipError, SipMethod, SipRequest, SipResponse};
use rsip::prelude::*;
use rsip::{Header, Headers, Request, Response, StatusCode, Version};

pub const BRANCH_MAGIC: &str = "z9hG4bK";

pub fn new_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, uuid::Uuid::new_v4().simple())
}

pub fn new_tag() -> String {
    format!("{}", rand::random::<u32>())
}

pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Build a SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn unauthorized() -> Self {
        Self::new(401)
    }

    pub fn server_internal_error() -> Self {
        Self::new(500)
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn build_for_request(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers = Vec::with_capacity(self.headers.len() + 6);

        // Copy essential headers from request
        for header in request.headers().iter() {
            match header {
                Header::To(to) if self.status_code > 100 && request.to_tag().is_none() => {
                    headers.push(Header::To(
                        format!("{};tag={}", to.value(), new_tag()).into(),
                    ));
                }
                Header::Via(_)
                | Header::From(_)
                | Header::To(_)
                | Header::CallId(_)
                | Header::CSeq(_) => {
                    headers.push(header.clone());
                }
                _ => {}
            }
        }
        headers.extend(self.headers);

        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            body: self.body,
            version: Version::V2,
        };

        Ok(SipResponse::new(response))
    }
}

/// Build an outbound SIP request
pub struct RequestBuilder {
    method: SipMethod,
    uri: String,
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// `SIP/2.0/<transport> <host>:<port>;rport;branch=<branch>`
    pub fn via(mut self, transport: &str, host: &str, port: u16, branch: &str) -> Self {
        self.headers.push(Header::Via(
            format!("SIP/2.0/{} {}:{};rport;branch={}", transport, host, port, branch).into(),
        ));
        self
    }

    pub fn from(mut self, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.headers.push(Header::From(value.into()));
        self
    }

    pub fn to(mut self, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.headers.push(Header::To(value.into()));
        self
    }

    pub fn call_id(mut self, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.headers.push(Header::CallId(value.into()));
        self
    }

    /// CSeq with this request's method
    pub fn cseq(mut self, seq: u32) -> Self {
        self.headers
            .push(Header::CSeq(format!("{} {}", seq, self.method).into()));
        self
    }

    pub fn contact(mut self, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.headers.push(Header::Contact(value.into()));
        self
    }

    pub fn max_forwards(mut self, hops: u32) -> Self {
        self.headers.push(Header::MaxForwards(hops.to_string().into()));
        self
    }

    pub fn user_agent(mut self, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.headers.push(Header::UserAgent(value.into()));
        self
    }

    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        let value: String = value.into();
        self.headers.push(Header::ContentType(value.into()));
        self
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .push(Header::Other(name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<SipRequest, SipError> {
        let uri = rsip::Uri::try_from(self.uri.as_str())?;
        let mut headers = self.headers;
        headers.push(Header::ContentLength(self.body.len().to_string().into()));

        Ok(SipRequest::new(Request {
            method: self.method.to_rsip(),
            uri,
            version: Version::V2,
            headers: Headers::from(headers),
            body: self.body,
        }))
    }
}
