//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

use http::{Method, StatusCode};

/// Result type often returned from methods that can have `quay` errors.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP exchanges.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The request head could not be parsed.
    Parse(Parse),
    /// The request body could not be framed or decoded.
    Body(BodyKind),
    /// No handler could be resolved for the request.
    Route(RouteKind),
    /// An application collaborator misbehaved.
    User(User),
    /// An `Expect` header with a value other than `100-continue`.
    ExpectationFailed,
    /// No request head arrived within the idle timeout.
    IdleTimeout,
    /// An `io::Error` occurred while reading or writing the channel.
    Io,
    /// The peer closed the stream in the middle of a request head.
    IncompleteMessage,
    /// Error creating or accepting on the listener.
    Listen,
    /// The server is stopping and interrupted the exchange.
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Parse {
    RequestLine {
        at: usize,
        prev: Option<u8>,
        byte: Option<u8>,
        msg: &'static str,
    },
    Header {
        at: usize,
        prev: Option<u8>,
        byte: Option<u8>,
        msg: &'static str,
    },
    Version {
        at: usize,
        prev: Option<u8>,
        byte: Option<u8>,
        msg: &'static str,
    },
    /// Head grew past the configured maximum.
    TooLarge,
    /// HTTP version below the configured minimum.
    VersionTooOld,
    /// HTTP major version 2 or above.
    VersionTooNew,
}

#[derive(Debug)]
pub(crate) enum BodyKind {
    /// Both `Content-Length` and `Transfer-Encoding` were present.
    ConflictingFraming,
    /// `Content-Length` was not a single non-negative integer.
    BadContentLength,
    /// A transfer coding other than a final `chunked`.
    UnsupportedTransferCoding,
    /// A TRACE request declared a body.
    IllegalRequestBody,
    /// Malformed chunk framing; carries the offending byte when known.
    Chunk {
        byte: Option<u8>,
        msg: &'static str,
    },
    /// Body materialization grew past the configured buffer maximum.
    TooLarge,
    /// End of stream before the declared length was delivered.
    Eof,
    /// Trailer block after the chunked body could not be parsed.
    Trailer,
}

#[derive(Debug)]
pub(crate) enum RouteKind {
    NotFound,
    MethodNotAllowed(Vec<Method>),
    MediaTypeUnsupported,
    MediaTypeNotAccepted,
    Ambiguous,
}

#[derive(Debug)]
pub(crate) enum User {
    /// The handler returned an error (or panicked).
    Handler,
    /// The processing chain produced no response at all.
    NoResponse,
    /// The processing chain both wrote and returned a final response.
    WroteAndReturned,
    /// The scoped channel was used outside the handler invocation.
    ChannelOutsideScope,
    /// A non-1xx response was given to the interim writer.
    NotInterim,
    /// A second final response was written to the channel.
    ResponseAlreadySent,
    /// Forbidden framing headers on the response.
    UnexpectedFraming(&'static str),
    /// A response body where none is allowed.
    UnexpectedBody(&'static str),
    /// Declared Content-Length does not match the actual body length.
    LengthMismatch { declared: u64, actual: u64 },
    /// The response body stream failed.
    BodyWrite,
    /// An after-action failed.
    AfterAction,
    /// The error handler chain itself failed.
    ErrorHandler,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_body(body: BodyKind) -> Error {
        Error::new(Kind::Body(body))
    }

    pub(crate) fn new_route(route: RouteKind) -> Error {
        Error::new(Kind::Route(route))
    }

    pub(crate) fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_idle_timeout() -> Error {
        Error::new(Kind::IdleTimeout)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_shutdown() -> Error {
        Error::new(Kind::Shutdown)
    }

    /// Returns true if this was an error while parsing the request head.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was an error decoding or framing a body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body(_))
    }

    /// Returns true if no route or handler could be resolved.
    pub fn is_routing(&self) -> bool {
        matches!(self.inner.kind, Kind::Route(_))
    }

    /// Returns true if an application collaborator caused this error.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if this error was caused by channel I/O.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the idle-connection timeout elapsed.
    pub fn is_idle_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::IdleTimeout)
    }

    /// Returns true if the peer disconnected mid-request.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::IncompleteMessage | Kind::Body(BodyKind::Eof)
        )
    }

    /// Returns true if the server's stop interrupted this exchange.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.inner.kind, Kind::Shutdown)
    }

    /// The status code this error translates to, if a response is owed.
    ///
    /// `None` means the connection is closed silently without a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Parse(Parse::RequestLine { .. })
            | Kind::Parse(Parse::Header { .. })
            | Kind::Parse(Parse::Version { .. }) => Some(StatusCode::BAD_REQUEST),
            Kind::Parse(Parse::TooLarge) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Kind::Parse(Parse::VersionTooOld) => Some(StatusCode::UPGRADE_REQUIRED),
            Kind::Parse(Parse::VersionTooNew) => Some(StatusCode::HTTP_VERSION_NOT_SUPPORTED),
            Kind::Body(BodyKind::ConflictingFraming)
            | Kind::Body(BodyKind::BadContentLength)
            | Kind::Body(BodyKind::IllegalRequestBody)
            | Kind::Body(BodyKind::Chunk { .. }) => Some(StatusCode::BAD_REQUEST),
            Kind::Body(BodyKind::UnsupportedTransferCoding) => Some(StatusCode::NOT_IMPLEMENTED),
            Kind::Body(BodyKind::TooLarge) => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Kind::Body(BodyKind::Eof) | Kind::Body(BodyKind::Trailer) => None,
            Kind::Route(RouteKind::NotFound) => Some(StatusCode::NOT_FOUND),
            Kind::Route(RouteKind::MethodNotAllowed(_)) => Some(StatusCode::METHOD_NOT_ALLOWED),
            Kind::Route(RouteKind::MediaTypeUnsupported) => {
                Some(StatusCode::UNSUPPORTED_MEDIA_TYPE)
            }
            Kind::Route(RouteKind::MediaTypeNotAccepted) => Some(StatusCode::NOT_ACCEPTABLE),
            Kind::Route(RouteKind::Ambiguous) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            Kind::User(_) => Some(StatusCode::INTERNAL_SERVER_ERROR),
            Kind::ExpectationFailed => Some(StatusCode::EXPECTATION_FAILED),
            Kind::IdleTimeout => Some(StatusCode::REQUEST_TIMEOUT),
            Kind::Io | Kind::IncompleteMessage | Kind::Listen | Kind::Shutdown => None,
        }
    }

    /// Whether the connection must close after any response to this error.
    pub(crate) fn must_close_connection(&self) -> bool {
        match self.inner.kind {
            Kind::Parse(_) => true,
            Kind::Body(_) => true,
            Kind::Route(_) => false,
            Kind::User(User::WroteAndReturned) => true,
            Kind::User(_) => false,
            Kind::ExpectationFailed => false,
            Kind::IdleTimeout => true,
            Kind::Io | Kind::IncompleteMessage | Kind::Listen | Kind::Shutdown => true,
        }
    }

    /// The `Allow` header values for a 405, when applicable.
    pub(crate) fn allowed_methods(&self) -> Option<&[Method]> {
        match self.inner.kind {
            Kind::Route(RouteKind::MethodNotAllowed(ref methods)) => Some(methods),
            _ => None,
        }
    }

    fn description(&self) -> String {
        match self.inner.kind {
            Kind::Parse(Parse::RequestLine { at, prev, byte, msg }) => {
                parse_description("invalid request line", at, prev, byte, msg)
            }
            Kind::Parse(Parse::Header { at, prev, byte, msg }) => {
                parse_description("invalid header field", at, prev, byte, msg)
            }
            Kind::Parse(Parse::Version { at, prev, byte, msg }) => {
                parse_description("invalid HTTP version", at, prev, byte, msg)
            }
            Kind::Parse(Parse::TooLarge) => "request head exceeded the configured maximum".into(),
            Kind::Parse(Parse::VersionTooOld) => "HTTP version not supported, too old".into(),
            Kind::Parse(Parse::VersionTooNew) => "HTTP version not supported, too new".into(),
            Kind::Body(BodyKind::ConflictingFraming) => {
                "Content-Length and Transfer-Encoding are both present.".into()
            }
            Kind::Body(BodyKind::BadContentLength) => "invalid Content-Length".into(),
            Kind::Body(BodyKind::UnsupportedTransferCoding) => {
                "unsupported transfer coding".into()
            }
            Kind::Body(BodyKind::IllegalRequestBody) => {
                "TRACE request may not have a body".into()
            }
            Kind::Body(BodyKind::Chunk { byte, msg }) => match byte {
                Some(b) => format!("{} (byte: {:?})", msg, b as char),
                None => msg.into(),
            },
            Kind::Body(BodyKind::TooLarge) => {
                "request body exceeded the configured buffer maximum".into()
            }
            Kind::Body(BodyKind::Eof) => "end of stream before message length reached".into(),
            Kind::Body(BodyKind::Trailer) => "invalid trailer block".into(),
            Kind::Route(RouteKind::NotFound) => "no route matched the request target".into(),
            Kind::Route(RouteKind::MethodNotAllowed(_)) => "method not allowed".into(),
            Kind::Route(RouteKind::MediaTypeUnsupported) => {
                "no handler consuming the request media type".into()
            }
            Kind::Route(RouteKind::MediaTypeNotAccepted) => {
                "no handler producing an accepted media type".into()
            }
            Kind::Route(RouteKind::Ambiguous) => "ambiguous handler candidates".into(),
            Kind::User(User::Handler) => "handler failed".into(),
            Kind::User(User::NoResponse) => "request processing chain produced no response".into(),
            Kind::User(User::WroteAndReturned) => {
                "Request processing chain both wrote and returned a final response".into()
            }
            Kind::User(User::ChannelOutsideScope) => {
                "client channel used outside the handler invocation".into()
            }
            Kind::User(User::NotInterim) => "interim write requires a 1xx status".into(),
            Kind::User(User::ResponseAlreadySent) => "a final response was already sent".into(),
            Kind::User(User::UnexpectedFraming(msg)) | Kind::User(User::UnexpectedBody(msg)) => {
                msg.into()
            }
            Kind::User(User::LengthMismatch { declared, actual }) => format!(
                "Discrepancy between Content-Length={} and actual body length {}",
                declared, actual
            ),
            Kind::User(User::BodyWrite) => "response body stream failed".into(),
            Kind::User(User::AfterAction) => "after-action failed".into(),
            Kind::User(User::ErrorHandler) => "error handler failed".into(),
            Kind::ExpectationFailed => "unsupported expectation".into(),
            Kind::IdleTimeout => "idle connection timed out".into(),
            Kind::Io => "channel error".into(),
            Kind::IncompleteMessage => "upstream finished prematurely".into(),
            Kind::Listen => "listener error".into(),
            Kind::Shutdown => "server stopped during the exchange".into(),
        }
    }
}

fn parse_description(
    what: &str,
    at: usize,
    prev: Option<u8>,
    byte: Option<u8>,
    msg: &'static str,
) -> String {
    use std::fmt::Write;

    let mut s = format!("{}: {} at position {}", what, msg, at);
    if let Some(p) = prev {
        let _ = write!(s, ", previous byte {:?}", p as char);
    }
    match byte {
        Some(b) => {
            let _ = write!(s, ", offending byte {:?}", b as char);
        }
        None => s.push_str(", at end of input"),
    }
    s
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("quay::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_framing_message_is_literal() {
        let err = Error::new_body(BodyKind::ConflictingFraming);
        assert_eq!(
            err.to_string(),
            "Content-Length and Transfer-Encoding are both present."
        );
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
        assert!(err.must_close_connection());
    }

    #[test]
    fn length_mismatch_message_is_literal() {
        let err = Error::new_user(User::LengthMismatch {
            declared: 10,
            actual: 7,
        });
        assert_eq!(
            err.to_string(),
            "Discrepancy between Content-Length=10 and actual body length 7"
        );
        assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!err.must_close_connection());
    }

    #[test]
    fn routing_errors_keep_the_connection() {
        for err in [
            Error::new_route(RouteKind::NotFound),
            Error::new_route(RouteKind::MethodNotAllowed(vec![Method::GET])),
            Error::new_route(RouteKind::MediaTypeUnsupported),
            Error::new_route(RouteKind::MediaTypeNotAccepted),
        ] {
            assert!(!err.must_close_connection(), "{:?}", err);
        }
    }

    #[test]
    fn silent_kinds_owe_no_response() {
        assert_eq!(Error::new_incomplete().status(), None);
        assert_eq!(Error::new_body(BodyKind::Eof).status(), None);
        assert_eq!(
            Error::new_io(std::io::Error::new(std::io::ErrorKind::Other, "x")).status(),
            None
        );
    }

    #[test]
    fn parse_error_carries_position_context() {
        let err = Error::new_parse(Parse::Header {
            at: 25,
            prev: Some(b'e'),
            byte: Some(b' '),
            msg: "whitespace before colon",
        });
        let msg = err.to_string();
        assert!(msg.contains("position 25"), "{}", msg);
        assert!(msg.contains("' '"), "{}", msg);
    }
}
