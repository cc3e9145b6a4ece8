//! HTTP/1.1 wire types shared by the server and the client.
//!
//! This module provides the core HTTP primitives:
//! [`Method`], [`StatusCode`], [`Headers`], [`Request`], and [`Response`].
//! Both directions are parsed with [`httparse`] and serialized by hand.

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::{Request, RequestError};
pub use response::{Response, ResponseError};

macro_rules! status_codes {
    (
        $(#[$meta:meta])*
        pub enum $ty:ident {
            $( $(#[$doc:meta])* $name:ident = $code:literal, $reason:literal; )+
        }
    ) => {
        $(#[$meta])*
        pub enum $ty {
            $( $(#[$doc])* $name, )+
            /// A status code with no named variant, kept as read off the wire.
            ///
            /// Build it through [`StatusCode::from_wire`] so that named codes
            /// never end up here.
            Other(u16),
        }

        impl $ty {
            /// Returns the numeric status code as a `u16`.
            pub fn as_u16(self) -> u16 {
                match self {
                    $( Self::$name => $code, )+
                    Self::Other(code) => code,
                }
            }

            /// Maps a numeric code to its named status, if it has one.
            pub fn from_u16(code: u16) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$name), )+
                    _ => None,
                }
            }

            /// Returns the canonical reason phrase, or `""` for
            /// [`StatusCode::Other`].
            pub fn canonical_reason(self) -> &'static str {
                match self {
                    $( Self::$name => $reason, )+
                    Self::Other(_) => "",
                }
            }
        }
    };
}

status_codes! {
    /// An HTTP response status code.
    ///
    /// # Examples
    ///
    /// ```
    /// use pledge::http::StatusCode;
    ///
    /// let status = StatusCode::Ok;
    /// assert_eq!(status.as_u16(), 200);
    /// assert_eq!(status.canonical_reason(), "OK");
    /// assert!(status.is_success());
    /// assert_eq!(StatusCode::from_u16(404), Some(StatusCode::NotFound));
    /// assert_eq!(StatusCode::from_wire(418), StatusCode::Other(418));
    /// ```
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum StatusCode {
        // 1xx Informational
        Continue = 100, "Continue";
        SwitchingProtocols = 101, "Switching Protocols";

        // 2xx Success
        Ok = 200, "OK";
        Created = 201, "Created";
        Accepted = 202, "Accepted";
        NoContent = 204, "No Content";
        PartialContent = 206, "Partial Content";

        // 3xx Redirection
        MovedPermanently = 301, "Moved Permanently";
        Found = 302, "Found";
        SeeOther = 303, "See Other";
        NotModified = 304, "Not Modified";
        TemporaryRedirect = 307, "Temporary Redirect";
        PermanentRedirect = 308, "Permanent Redirect";

        // 4xx Client Error
        BadRequest = 400, "Bad Request";
        Unauthorized = 401, "Unauthorized";
        Forbidden = 403, "Forbidden";
        NotFound = 404, "Not Found";
        MethodNotAllowed = 405, "Method Not Allowed";
        Conflict = 409, "Conflict";
        Gone = 410, "Gone";
        LengthRequired = 411, "Length Required";
        PayloadTooLarge = 413, "Payload Too Large";
        UriTooLong = 414, "URI Too Long";
        UnsupportedMediaType = 415, "Unsupported Media Type";
        UnprocessableEntity = 422, "Unprocessable Entity";
        TooManyRequests = 429, "Too Many Requests";

        // 5xx Server Error
        InternalServerError = 500, "Internal Server Error";
        NotImplemented = 501, "Not Implemented";
        BadGateway = 502, "Bad Gateway";
        ServiceUnavailable = 503, "Service Unavailable";
        GatewayTimeout = 504, "Gateway Timeout";
        HttpVersionNotSupported = 505, "HTTP Version Not Supported";
    }
}

impl StatusCode {
    /// Returns `true` for 2xx codes.
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.as_u16())
    }

    /// Maps any code read off the wire to a status, falling back to
    /// [`StatusCode::Other`].
    pub fn from_wire(code: u16) -> Self {
        Self::from_u16(code).unwrap_or(Self::Other(code))
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "{code}"),
            named => write!(f, "{} {}", named.as_u16(), named.canonical_reason()),
        }
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::from_u16(code).ok_or(code)
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// An HTTP request method.
///
/// Standard methods are represented as unit variants for zero-cost comparison.
/// Non-standard methods are captured in the `Custom` variant.
///
/// # Examples
///
/// ```
/// use pledge::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert_eq!(method.as_str(), "GET");
/// assert!(method.is_safe());
/// assert!(method.is_idempotent());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET — retrieve a representation of the target resource.
    Get,
    /// POST — perform resource-specific processing on the request payload.
    Post,
    /// PUT — replace the target resource's current representation.
    Put,
    /// DELETE — remove the association between the target resource and its functionality.
    Delete,
    /// HEAD — identical to GET but without a response body.
    Head,
    /// OPTIONS — describe the communication options for the target resource.
    Options,
    /// PATCH — apply partial modifications to a resource.
    Patch,
    /// CONNECT — establish a tunnel to the server identified by the target resource.
    Connect,
    /// TRACE — perform a message loop-back test along the path to the target resource.
    Trace,
    /// A non-standard extension method.
    Custom(String),
}

impl Method {
    /// Returns the method as a string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Returns `true` if this method is considered "safe" (no side effects per RFC 9110 §9.2.1).
    ///
    /// Safe methods: GET, HEAD, OPTIONS, TRACE.
    pub fn is_safe(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options | Self::Trace)
    }

    /// Returns `true` if this method is idempotent (RFC 9110 §9.2.2).
    ///
    /// Idempotent methods: GET, HEAD, PUT, DELETE, OPTIONS, TRACE.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::Get | Self::Head | Self::Put | Self::Delete | Self::Options | Self::Trace
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "CONNECT" => Self::Connect,
            "TRACE" => Self::Trace,
            other => Self::Custom(other.to_owned()),
        })
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
