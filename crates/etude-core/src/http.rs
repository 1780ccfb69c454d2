// src/http.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
    Patch,
}

impl Method {
    /// Case-sensitive match of a request-line method token.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"HEAD" => Some(Method::Head),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"TRACE" => Some(Method::Trace),
            b"OPTIONS" => Some(Method::Options),
            b"CONNECT" => Some(Method::Connect),
            b"PATCH" => Some(Method::Patch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Options => "OPTIONS",
            Method::Connect => "CONNECT",
            Method::Patch => "PATCH",
        }
    }
}

/// Parse phase of the request state machine. Only ever moves forward
/// until the connection is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Headers,
    Content,
}

/// Outcome of a parse or resolve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Request incomplete, wait for more input.
    NoRequest,
    /// A full request was parsed and is ready to be resolved.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    /// Resolved to a mapped file, serve it with a body.
    FileRequest,
    InternalError,
    ClosedConnection,
}

impl HttpCode {
    /// The response status for terminal outcomes. `None` for outcomes that
    /// cannot be answered with a response.
    pub fn status(self) -> Option<Status> {
        match self {
            HttpCode::FileRequest => Some(Status::Ok),
            HttpCode::BadRequest => Some(Status::BadRequest),
            HttpCode::ForbiddenRequest => Some(Status::Forbidden),
            HttpCode::NoResource => Some(Status::NotFound),
            HttpCode::InternalError => Some(Status::InternalError),
            HttpCode::NoRequest | HttpCode::GetRequest | HttpCode::ClosedConnection => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Server Error",
        }
    }

    /// Canned HTML body for error statuses. A 200 carries the file instead.
    pub fn canned_body(self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => Some(
                "<html><head><title>400 Bad Request</title></head><body>\
                 <h1>Bad Request</h1>\
                 <p>Your request has bad syntax or is inherently impossible to satisfy.</p>\
                 </body></html>\n",
            ),
            Status::Forbidden => Some(
                "<html><head><title>403 Forbidden</title></head><body>\
                 <h1>Forbidden</h1>\
                 <p>You do not have permission to get this file from the server.</p>\
                 </body></html>\n",
            ),
            Status::NotFound => Some(
                "<html><head><title>404 Not Found</title></head><body>\
                 <h1>Not Found</h1>\
                 <p>The requested file was not found on this server.</p>\
                 </body></html>\n",
            ),
            Status::InternalError => Some(
                "<html><head><title>500 Internal Server Error</title></head><body>\
                 <h1>Internal Server Error</h1>\
                 <p>There was an unusual problem serving the requested file.</p>\
                 </body></html>\n",
            ),
        }
    }
}
