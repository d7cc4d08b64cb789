//! Server configuration.

use std::time::Duration;

/// The lowest request HTTP version the server accepts.
///
/// Requests below the minimum are answered with `426 Upgrade Required`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinVersion {
    /// Accept HTTP/1.0 and HTTP/1.1 requests.
    Http10,
    /// Accept only HTTP/1.1 requests.
    Http11,
}

/// Fine-grained configuration of the HTTP server.
///
/// All options have conservative defaults; override them with the
/// builder-style setters.
///
/// ```
/// use std::time::Duration;
/// use quay::ServerConfig;
///
/// let config = ServerConfig::new()
///     .max_request_head_size(16 * 1024)
///     .timeout_idle_connection(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub(crate) max_request_head_size: usize,
    pub(crate) max_request_body_buffer_size: usize,
    pub(crate) immediately_continue_expect_100: bool,
    pub(crate) min_version: MinVersion,
    pub(crate) timeout_idle_connection: Duration,
    pub(crate) max_error_responses: u32,
    pub(crate) stop_grace_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            max_request_head_size: 8192,
            max_request_body_buffer_size: 4 * 1024 * 1024,
            immediately_continue_expect_100: false,
            min_version: MinVersion::Http10,
            timeout_idle_connection: Duration::from_secs(90),
            max_error_responses: 4,
            stop_grace_period: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with the default values.
    pub fn new() -> ServerConfig {
        ServerConfig::default()
    }

    /// Maximum byte size of a request head (request line plus headers).
    ///
    /// Exceeding it yields `413 Payload Too Large` and closes the
    /// connection. Default is 8192.
    pub fn max_request_head_size(mut self, max: usize) -> Self {
        self.max_request_head_size = max;
        self
    }

    /// Maximum bytes buffered when materializing or draining a request body.
    ///
    /// Default is 4 MiB.
    pub fn max_request_body_buffer_size(mut self, max: usize) -> Self {
        self.max_request_body_buffer_size = max;
        self
    }

    /// Respond `100 Continue` as soon as `Expect: 100-continue` is seen,
    /// instead of deferring until the handler's first body read.
    ///
    /// Default is `false`.
    pub fn immediately_continue_expect_100(mut self, enabled: bool) -> Self {
        self.immediately_continue_expect_100 = enabled;
        self
    }

    /// The lowest accepted request HTTP version. Default accepts 1.0.
    pub fn min_version(mut self, min: MinVersion) -> Self {
        self.min_version = min;
        self
    }

    /// How long a connection may sit without request-head bytes before it
    /// is answered `408 Request Timeout` and closed. Default is 90 seconds.
    pub fn timeout_idle_connection(mut self, timeout: Duration) -> Self {
        self.timeout_idle_connection = timeout;
        self
    }

    /// How many consecutive non-2xx responses a connection may produce
    /// before it is closed. Default is 4.
    pub fn max_error_responses(mut self, max: u32) -> Self {
        self.max_error_responses = max;
        self
    }

    /// How long `stop()` waits for active exchanges before interrupting
    /// them. Default is 5 seconds.
    pub fn stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }
}
