// src/request.rs
use crate::buffer::{LineStatus, READ_BUFFER_SIZE, ReadBuffer};
use crate::http::{CheckState, HttpCode, Method};
use arrayvec::ArrayString;
use memchr::{memchr, memchr2};

/// A URL is a copy of part of one request line, so it can never be longer
/// than the read buffer.
pub const URL_CAPACITY: usize = READ_BUFFER_SIZE;
pub const HOST_CAPACITY: usize = 256;
pub const VERSION_CAPACITY: usize = 8;

const HTTP_1_1: &[u8] = b"HTTP/1.1";

/// Incremental HTTP/1.1 request parser.
///
/// The parsed fields are owned copies, so they stay valid no matter what
/// happens to the read buffer afterwards; they are cleared by [`reset`](Self::reset).
#[derive(Debug, Default)]
pub struct Request {
    check_state: CheckState,
    method: Method,
    url: ArrayString<URL_CAPACITY>,
    version: ArrayString<VERSION_CAPACITY>,
    host: ArrayString<HOST_CAPACITY>,
    content_length: usize,
    keep_alive: bool,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.check_state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.version.clear();
        self.host.clear();
        self.content_length = 0;
        self.keep_alive = false;
    }

    pub fn check_state(&self) -> CheckState {
        self.check_state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn host(&self) -> Option<&str> {
        (!self.host.is_empty()).then_some(self.host.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Drive the state machine over whatever `buf` holds.
    ///
    /// Returns `NoRequest` when more input is needed, `GetRequest` once the
    /// request is complete, or `BadRequest`.
    pub fn process_read(&mut self, buf: &mut ReadBuffer) -> HttpCode {
        loop {
            let state = self.check_state;
            if state == CheckState::Content {
                return self.parse_content(buf);
            }

            match buf.parse_line() {
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
                LineStatus::Ok => {}
            }

            let code = if state == CheckState::RequestLine {
                self.parse_request_line(buf.get_line())
            } else {
                self.parse_header(buf.get_line())
            };
            buf.next_line();

            if code != HttpCode::NoRequest {
                return code;
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> HttpCode {
        let Some(sp) = memchr2(b' ', b'\t', line) else {
            return HttpCode::BadRequest;
        };
        let Some(method) = Method::from_bytes(&line[..sp]) else {
            return HttpCode::BadRequest;
        };

        let rest = skip_blanks(&line[sp..]);
        let Some(sp) = memchr2(b' ', b'\t', rest) else {
            return HttpCode::BadRequest;
        };
        let url = &rest[..sp];
        let version = skip_blanks(&rest[sp..]);

        if version != HTTP_1_1 {
            return HttpCode::BadRequest;
        }

        let url = match strip_scheme(url) {
            Some(url) if url.first() == Some(&b'/') => url,
            _ => return HttpCode::BadRequest,
        };
        let Ok(url) = std::str::from_utf8(url) else {
            return HttpCode::BadRequest;
        };

        self.url.clear();
        if self.url.try_push_str(url).is_err() {
            return HttpCode::BadRequest;
        }
        if self.url.as_str() == "/" && self.url.try_push_str("index.html").is_err() {
            return HttpCode::BadRequest;
        }

        self.method = method;
        self.version.clear();
        self.version.push_str("HTTP/1.1");
        self.check_state = CheckState::Headers;

        tracing::debug!(method = method.as_str(), url = %self.url, "request line");
        HttpCode::NoRequest
    }

    fn parse_header(&mut self, line: &[u8]) -> HttpCode {
        if line.is_empty() {
            if self.content_length > 0 {
                self.check_state = CheckState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        if let Some(value) = header_value(line, b"Connection:") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            } else if value.eq_ignore_ascii_case(b"close") {
                self.keep_alive = false;
            }
        } else if let Some(value) = header_value(line, b"Content-Length:") {
            match std::str::from_utf8(value).ok().and_then(|v| v.parse().ok()) {
                Some(len) => self.content_length = len,
                None => return HttpCode::BadRequest,
            }
        } else if let Some(value) = header_value(line, b"Host:") {
            let Ok(host) = std::str::from_utf8(value) else {
                return HttpCode::BadRequest;
            };
            self.host.clear();
            if self.host.try_push_str(host).is_err() {
                return HttpCode::BadRequest;
            }
        } else {
            tracing::trace!(header = %String::from_utf8_lossy(line), "ignoring unknown header");
        }

        HttpCode::NoRequest
    }

    fn parse_content(&mut self, buf: &ReadBuffer) -> HttpCode {
        match buf.content(self.content_length) {
            Some(_) => HttpCode::GetRequest,
            None => HttpCode::NoRequest,
        }
    }
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn skip_blanks(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| !is_blank(b)).unwrap_or(bytes.len());
    &bytes[start..]
}

fn trim_blanks(bytes: &[u8]) -> &[u8] {
    let bytes = skip_blanks(bytes);
    let end = bytes.iter().rposition(|&b| !is_blank(b)).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Value of `line` if it starts with header `name` (including the colon),
/// compared case-insensitively.
fn header_value<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() >= name.len() && line[..name.len()].eq_ignore_ascii_case(name) {
        Some(trim_blanks(&line[name.len()..]))
    } else {
        None
    }
}

/// Drop an `http://host` or `https://host` prefix. `None` when an absolute
/// URL has no path at all.
fn strip_scheme(url: &[u8]) -> Option<&[u8]> {
    for scheme in [&b"http://"[..], &b"https://"[..]] {
        if url.len() >= scheme.len() && url[..scheme.len()].eq_ignore_ascii_case(scheme) {
            let rest = &url[scheme.len()..];
            return memchr(b'/', rest).map(|i| &rest[i..]);
        }
    }
    Some(url)
}
