//! The exchange state machine: one request/response cycle on a connection.
//!
//! An exchange is created when the first byte of a new request arrives and
//! is destroyed when the final response has been fully written (or the
//! connection dies). It exclusively owns the response-writing privilege;
//! at most one final response leaves per exchange.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use futures_util::FutureExt;
use http::header::{HeaderValue, CONNECTION};
use http::{Method, Request, Response, StatusCode, Version};

use super::decode::Decoder;
use super::framing;
use super::io::SharedIo;
use super::parse;
use crate::body::{next_frame, Body, DrainResult, Incoming};
use crate::config::{MinVersion, ServerConfig};
use crate::error::{Kind, Parse, User};
use crate::event::{Event, Events};
use crate::headers;
use crate::routing::Resolution;
use crate::service::{App, BeforeOutcome, Chain, RequestHead};
use crate::{Error, Result};

/// Exchange lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    ReadingHead = 0,
    Routing = 1,
    AwaitingHandler = 2,
    SendingInterim = 3,
    WritingResponse = 4,
    Draining = 5,
    Completed = 6,
    Aborted = 7,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::ReadingHead,
            1 => State::Routing,
            2 => State::AwaitingHandler,
            3 => State::SendingInterim,
            4 => State::WritingResponse,
            5 => State::Draining,
            6 => State::Completed,
            _ => State::Aborted,
        }
    }
}

/// State shared between the exchange, the body handle and the scoped
/// channel. All three run on the connection's worker.
pub(crate) struct ExchangeShared {
    state: AtomicU8,
    pub(crate) continue_pending: AtomicBool,
    pub(crate) continue_sent: AtomicBool,
    continue_repeats: AtomicU32,
    written: std::sync::Mutex<Option<Response<Body>>>,
}

impl ExchangeShared {
    fn new() -> Arc<ExchangeShared> {
        Arc::new(ExchangeShared {
            state: AtomicU8::new(State::ReadingHead as u8),
            continue_pending: AtomicBool::new(false),
            continue_sent: AtomicBool::new(false),
            continue_repeats: AtomicU32::new(0),
            written: std::sync::Mutex::new(None),
        })
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: State) {
        tracing::trace!("exchange state -> {:?}", state);
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// The scoped channel is usable only while the handler runs.
    fn scope_open(&self) -> bool {
        matches!(self.state(), State::AwaitingHandler | State::SendingInterim)
    }

    fn take_written(&self) -> Option<Response<Body>> {
        self.written
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// The connection-write handle scoped to one handler invocation.
///
/// Interim (1xx) responses go to the wire immediately; the final response
/// is recorded and leaves after the after-actions have run. Any use after
/// the handler has returned is rejected.
pub struct ClientChannel {
    io: SharedIo,
    shared: Arc<ExchangeShared>,
    req_version: Version,
}

impl ClientChannel {
    /// Writes an interim (1xx) response.
    ///
    /// A repeated `100 Continue` is suppressed on the wire; interim
    /// responses to HTTP/1.0 clients are dropped.
    pub async fn send_interim(&self, res: Response<()>) -> Result<()> {
        if !self.shared.scope_open() {
            return Err(Error::new_user(User::ChannelOutsideScope));
        }
        let status = res.status();
        if !status.is_informational() {
            return Err(Error::new_user(User::NotInterim));
        }
        if status == StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::new_user(User::UnexpectedFraming(
                "101 Switching Protocols is not supported",
            )));
        }
        if self.req_version == Version::HTTP_10 {
            tracing::debug!("dropping interim {} to an HTTP/1.0 client", status);
            return Ok(());
        }
        if status == StatusCode::CONTINUE {
            self.shared.continue_pending.store(false, Ordering::SeqCst);
            if self.shared.continue_sent.swap(true, Ordering::SeqCst) {
                let repeats = self.shared.continue_repeats.fetch_add(1, Ordering::SeqCst) + 1;
                if repeats == 1 {
                    tracing::debug!("suppressing repeated 100 Continue");
                } else {
                    tracing::warn!("suppressing repeated 100 Continue ({} repeats)", repeats);
                }
                return Ok(());
            }
        }

        self.shared.set_state(State::SendingInterim);
        let mut head = BytesMut::new();
        framing::write_head(status, res.headers(), &mut head);
        let mut io = self.io.lock().await;
        io.buffer(head);
        let result = io.flush().await.map_err(Error::new_io);
        self.shared.set_state(State::AwaitingHandler);
        result
    }

    /// Records the final response of this exchange.
    ///
    /// The response leaves the wire once the handler returns `None` and
    /// the after-actions have run. At most one final response is allowed.
    pub fn write(&self, res: Response<Body>) -> Result<()> {
        if !self.shared.scope_open() {
            return Err(Error::new_user(User::ChannelOutsideScope));
        }
        if res.status().is_informational() {
            return Err(Error::new_user(User::UnexpectedFraming(
                "a 1xx status cannot be the final response",
            )));
        }
        let mut slot = self
            .shared
            .written
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(Error::new_user(User::ResponseAlreadySent));
        }
        *slot = Some(res);
        Ok(())
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel").finish()
    }
}

/// What the connection loop needs to know after an exchange.
pub(crate) struct Outcome {
    pub(crate) persist: bool,
    pub(crate) error_streak: u32,
    pub(crate) hit_max_errors: bool,
}

pub(crate) async fn run(
    io: SharedIo,
    app: Arc<App>,
    config: Arc<ServerConfig>,
    events: Events,
    first_byte_at: Instant,
    error_streak: u32,
) -> Outcome {
    let exchange = Exchange {
        io,
        app,
        config,
        events,
        shared: ExchangeShared::new(),
        req_method: Method::GET,
        req_version: Version::HTTP_11,
        req_close: false,
        upgrade_close: false,
        head: None,
        close: false,
    };
    exchange.run(first_byte_at, error_streak).await
}

struct Exchange {
    io: SharedIo,
    app: Arc<App>,
    config: Arc<ServerConfig>,
    events: Events,
    shared: Arc<ExchangeShared>,
    req_method: Method,
    req_version: Version,
    /// The request side demanded a close (HTTP/1.0 or `Connection: close`).
    req_close: bool,
    /// Respond with `Connection: upgrade, close` (version policy).
    upgrade_close: bool,
    head: Option<Arc<RequestHead>>,
    close: bool,
}

impl Exchange {
    async fn run(mut self, first_byte_at: Instant, streak: u32) -> Outcome {
        // === ReadingHead ===
        let head = loop {
            let mut io = self.io.lock().await;
            match parse::parse_head(io.read_buf_mut(), self.config.max_request_head_size) {
                Ok(Some(head)) => break head,
                Ok(None) => {
                    let read = io.read_more().await;
                    let mid_head = !io.read_buf().is_empty();
                    drop(io);
                    match read {
                        Ok(0) => {
                            if mid_head {
                                // upstream finished prematurely
                                tracing::debug!("{}", Error::new_incomplete());
                            } else {
                                tracing::debug!("connection ended between requests");
                            }
                            return self.abort(streak).await;
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::debug!("channel error while reading request head: {}", e);
                            return self.abort(streak).await;
                        }
                    }
                }
                Err(e) => {
                    drop(io);
                    return self.fail(e, None, streak).await;
                }
            }
        };

        self.events.emit(Event::RequestHeadReceived {
            elapsed: first_byte_at.elapsed(),
            byte_count: head.head_len as u64,
        });

        self.req_method = head.method.clone();
        self.req_version = head.version;
        self.req_close =
            head.version == Version::HTTP_10 || headers::connection_close(&head.headers);
        self.head = Some(Arc::new(RequestHead {
            method: head.method.clone(),
            uri: head.uri.clone(),
            version: head.version,
            headers: head.headers.clone(),
        }));

        // === version policy ===
        if head.version == Version::HTTP_10 && self.config.min_version == MinVersion::Http11 {
            return self
                .fail(Error::new_parse(Parse::VersionTooOld), None, streak)
                .await;
        }

        // === body framing selection ===
        let decoder = match Decoder::for_request(&head.method, head.version, &head.headers) {
            Ok(decoder) => decoder,
            Err(e) => return self.fail(e, None, streak).await,
        };

        let (body, engine_body) = Incoming::pair(
            self.io.clone(),
            decoder,
            Arc::clone(&self.shared),
            self.config.max_request_body_buffer_size,
        );

        // === Expect ===
        if head.headers.contains_key(http::header::EXPECT) {
            if !headers::expect_continue(&head.headers) {
                return self
                    .fail(Error::new(Kind::ExpectationFailed), Some(engine_body), streak)
                    .await;
            }
            if head.version >= Version::HTTP_11 {
                if self.config.immediately_continue_expect_100 {
                    self.shared.set_state(State::SendingInterim);
                    let mut io = self.io.lock().await;
                    io.buffer_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
                    if let Err(e) = io.flush().await {
                        tracing::debug!("failed to send 100 Continue: {}", e);
                        drop(io);
                        return self.abort(streak).await;
                    }
                    self.shared.continue_sent.store(true, Ordering::SeqCst);
                } else {
                    self.shared.continue_pending.store(true, Ordering::SeqCst);
                }
            }
        }

        // === Routing ===
        self.shared.set_state(State::Routing);
        let path = {
            let p = head.uri.path();
            if p.is_empty() {
                "/".to_string()
            } else {
                p.to_string()
            }
        };
        let router = self.app.router();
        let resolution = match router.resolve(&head.method, &path, &head.headers) {
            Ok(resolution) => resolution,
            Err(e) => return self.fail(e, Some(engine_body), streak).await,
        };

        let (resolved, default_response) = match resolution {
            Resolution::Handler(resolved) => (Some(resolved), None),
            Resolution::DefaultOptions { allow } => (None, Some(default_options_response(&allow))),
        };

        let mut req = Request::new(body);
        *req.method_mut() = head.method.clone();
        *req.uri_mut() = head.uri.clone();
        *req.version_mut() = head.version;
        *req.headers_mut() = head.headers;
        if let Some(ref resolved) = resolved {
            req.extensions_mut().insert(resolved.params.clone());
        }

        // === AwaitingHandler: before-actions, then the handler ===
        self.shared.set_state(State::AwaitingHandler);
        let mut short: Option<Response<Body>> = None;
        let before = self.app.before.clone();
        for action in &before {
            match action.call(req).await {
                Ok(BeforeOutcome::Next(r)) => req = r,
                Ok(BeforeOutcome::Respond(r, res)) => {
                    req = r;
                    short = Some(res);
                    break;
                }
                Err(cause) => {
                    return self
                        .fail(
                            Error::new_user(User::Handler).with(cause),
                            Some(engine_body),
                            streak,
                        )
                        .await;
                }
            }
        }

        let result = if let Some(res) = short {
            Ok(Some(res))
        } else if let Some(res) = default_response {
            Ok(Some(res))
        } else if let Some(resolved) = resolved {
            let channel = ClientChannel {
                io: self.io.clone(),
                shared: Arc::clone(&self.shared),
                req_version: self.req_version,
            };
            match AssertUnwindSafe(resolved.handler.call(req, channel))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_panic) => Err("handler panicked".into()),
            }
        } else {
            unreachable!("resolution produced neither handler nor default response");
        };

        self.shared.set_state(State::WritingResponse);
        let written = self.shared.take_written();

        let response = match (result, written) {
            (Ok(Some(returned)), Some(written)) => {
                // the write came first and wins; the returned response is
                // the invariant violation and is discarded
                let err = Error::new_user(User::WroteAndReturned);
                tracing::error!("{}; discarding the returned response", err);
                self.close = true;
                drop(returned);
                written
            }
            (Ok(Some(res)), None) | (Ok(None), Some(res)) => res,
            (Ok(None), None) => {
                return self
                    .fail(Error::new_user(User::NoResponse), Some(engine_body), streak)
                    .await;
            }
            (Err(cause), _) => {
                return self
                    .fail(
                        Error::new_user(User::Handler).with(cause),
                        Some(engine_body),
                        streak,
                    )
                    .await;
            }
        };

        if response.status().is_informational() {
            return self
                .fail(
                    Error::new_user(User::UnexpectedFraming(
                        "a 1xx status cannot be the final response",
                    )),
                    Some(engine_body),
                    streak,
                )
                .await;
        }

        // === after-actions ===
        let head_snapshot = self.head.clone().expect("head was parsed");
        let mut response = response;
        let after = self.app.after.clone();
        for action in &after {
            match action.call(Arc::clone(&head_snapshot), response).await {
                Ok(res) => response = res,
                Err(cause) => {
                    tracing::debug!("after-action failed: {}", cause);
                    return self
                        .fail(
                            Error::new_user(User::AfterAction).with(cause),
                            Some(engine_body),
                            streak,
                        )
                        .await;
                }
            }
        }

        self.finish(response, Some(engine_body), streak).await
    }

    /// Translates an error into a response through the error handler
    /// chain, then writes it. Errors that owe no response close silently.
    async fn fail(mut self, error: Error, body: Option<Incoming>, streak: u32) -> Outcome {
        match error.status() {
            None => {
                tracing::debug!("closing without a response: {}", error);
                return self.abort(streak).await;
            }
            Some(status) => {
                // 400-class framing problems are the client's fault and
                // only traced; 500-class problems are logged loudly.
                if status.is_server_error() {
                    tracing::error!(error = %error, cause = ?std::error::Error::source(&error), "exchange failed");
                } else {
                    tracing::debug!("request rejected ({}): {}", status, error);
                }
            }
        }

        if error.must_close_connection() {
            self.close = true;
        }
        self.upgrade_close = matches!(error.kind(), Kind::Parse(Parse::VersionTooOld));

        self.shared.set_state(State::WritingResponse);
        // the chain consumes the error; keep its identity for the log line
        // in case the chain itself fails
        let original = error.to_string();
        let chain = Chain::new(error, &self.app.error_handlers, self.head.clone());
        let response = match chain.proceed().await {
            Ok(response) => response,
            Err(second) => {
                tracing::error!(
                    error = %second,
                    suppressed = %original,
                    "error handler failed; closing the connection without a response"
                );
                self.close = true;
                return self.abort(streak).await;
            }
        };
        self.finish(response, body, streak).await
    }

    /// Writes the final response, drains what the handler left unread,
    /// emits `ResponseSent` and decides persistence.
    async fn finish(self, response: Response<Body>, body: Option<Incoming>, streak: u32) -> Outcome {
        self.shared.set_state(State::WritingResponse);
        let scheduled_at = Instant::now();

        let (parts, mut out_body) = response.into_parts();
        let mut status = parts.status;
        let mut headers = parts.headers;
        let mut body_len = out_body.exact_len();

        let plan = match framing::plan(
            &self.req_method,
            self.req_version,
            status,
            &mut headers,
            body_len,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                // the response is discarded for an internal error
                tracing::error!("discarding response with illegal framing: {}", e);
                status = StatusCode::INTERNAL_SERVER_ERROR;
                headers = http::HeaderMap::new();
                out_body = Body::empty();
                body_len = Some(0);
                framing::plan(
                    &self.req_method,
                    self.req_version,
                    status,
                    &mut headers,
                    body_len,
                )
                .expect("empty 500 always has a framing")
            }
        };

        // === persistence decision, before the head is serialized ===
        let is_error_status = !status.is_success();
        let error_streak = if is_error_status { streak + 1 } else { 0 };
        let hit_max_errors =
            is_error_status && error_streak >= self.config.max_error_responses;

        let mut close = self.close
            || self.req_close
            || plan.force_close
            || hit_max_errors
            || headers::connection_close(&headers);
        {
            let io = self.io.lock().await;
            if io.is_read_eof() {
                close = true;
            }
        }

        if self.upgrade_close {
            close = true;
            headers.insert(CONNECTION, HeaderValue::from_static("upgrade, close"));
        } else if close && !headers::connection_close(&headers) {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }

        // === serialize and write ===
        let mut wire = BytesMut::new();
        framing::write_head(status, &headers, &mut wire);
        let mut byte_count = wire.len() as u64;
        {
            let mut io = self.io.lock().await;
            io.buffer(wire);

            if !plan.suppress_body {
                let mut encoder = plan.encoder;
                loop {
                    match next_frame(&mut out_body).await {
                        None => {
                            let mut tail = BytesMut::new();
                            if let Err(e) = encoder.end(&mut tail) {
                                tracing::error!("response body ended early: {}", e);
                                drop(io);
                                return self.abort_with(error_streak).await;
                            }
                            byte_count += tail.len() as u64;
                            io.buffer(tail);
                            break;
                        }
                        Some(Ok(frame)) => match frame.into_data() {
                            Ok(data) => {
                                if data.is_empty() {
                                    continue;
                                }
                                let mut chunk = BytesMut::new();
                                if let Err(e) = encoder.encode(&data, &mut chunk) {
                                    tracing::error!("{}", e);
                                    drop(io);
                                    return self.abort_with(error_streak).await;
                                }
                                byte_count += chunk.len() as u64;
                                io.buffer(chunk);
                                if io.write_buffered() >= 64 * 1024 && io.flush().await.is_err() {
                                    drop(io);
                                    return self.abort_with(error_streak).await;
                                }
                            }
                            Err(frame) => {
                                if let Ok(trailers) = frame.into_trailers() {
                                    let mut tail = BytesMut::new();
                                    encoder.encode_trailers(&trailers, &mut tail);
                                    byte_count += tail.len() as u64;
                                    io.buffer(tail);
                                }
                            }
                        },
                        Some(Err(e)) => {
                            // After the head is on the wire no recovery
                            // response can follow.
                            tracing::error!("response body stream failed: {}", e);
                            drop(io);
                            return self.abort_with(error_streak).await;
                        }
                    }
                }
            }

            if io.flush().await.is_err() {
                drop(io);
                return self.abort_with(error_streak).await;
            }
        }

        // === Draining ===
        self.shared.set_state(State::Draining);
        if let Some(body) = body {
            if !body.is_consumed().await {
                let continue_unanswered = self.shared.continue_pending.load(Ordering::SeqCst)
                    && !self.shared.continue_sent.load(Ordering::SeqCst);
                if continue_unanswered {
                    // the client is still waiting for a 100 Continue; the
                    // body may never come, so the connection cannot be
                    // reused
                    close = true;
                } else {
                    match body
                        .drain(self.config.max_request_body_buffer_size)
                        .await
                    {
                        DrainResult::Done => {}
                        DrainResult::TrailerError
                        | DrainResult::Overflow
                        | DrainResult::Failed => close = true,
                    }
                }
            }
        }

        self.events.emit(Event::ResponseSent {
            elapsed: scheduled_at.elapsed(),
            byte_count,
        });
        self.shared.set_state(State::Completed);

        if close {
            let mut io = self.io.lock().await;
            io.shutdown_write().await;
        }

        Outcome {
            persist: !close,
            error_streak,
            hit_max_errors,
        }
    }

    /// Closes the connection without (further) response.
    async fn abort(self, streak: u32) -> Outcome {
        // no response leaves, so the error streak is carried unchanged
        self.abort_with(streak).await
    }

    async fn abort_with(self, error_streak: u32) -> Outcome {
        self.shared.set_state(State::Aborted);
        let mut io = self.io.lock().await;
        io.shutdown_write().await;
        Outcome {
            persist: false,
            error_streak,
            hit_max_errors: false,
        }
    }
}

fn default_options_response(allow: &[Method]) -> Response<Body> {
    let mut value = String::from("OPTIONS");
    for method in allow {
        if *method != Method::OPTIONS {
            value.push_str(", ");
            value.push_str(method.as_str());
        }
    }
    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::NO_CONTENT;
    res.headers_mut().insert(
        http::header::ALLOW,
        HeaderValue::from_str(&value).expect("method tokens are valid header values"),
    );
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_lists_options_first() {
        let res = default_options_response(&[Method::GET, Method::HEAD]);
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            res.headers().get(http::header::ALLOW).unwrap(),
            "OPTIONS, GET, HEAD"
        );
    }

    #[test]
    fn states_round_trip_through_u8() {
        for state in [
            State::ReadingHead,
            State::Routing,
            State::AwaitingHandler,
            State::SendingInterim,
            State::WritingResponse,
            State::Draining,
            State::Completed,
            State::Aborted,
        ] {
            assert_eq!(State::from_u8(state as u8), state);
        }
    }
}
