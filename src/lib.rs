//! # quay
//!
//! A small and correct HTTP/1.1 server library.
//!
//! `quay` is the per-connection exchange engine of an HTTP server: it
//! frames requests, dispatches them to handlers through a routing table,
//! serializes responses, enforces protocol correctness, and manages the
//! connection lifecycle under concurrent load.
//!
//! ## Shape
//!
//! - Register handlers on a [`Router`] by method, path pattern
//!   (`/users/:id`, `/static/*`) and media types.
//! - Wrap it in a [`Server`], add before/after actions and error handlers,
//!   then [`bind`](Server::bind) — or hand it individual duplex channels
//!   with [`serve_connection`](Server::serve_connection) when sockets and
//!   TLS are terminated elsewhere.
//! - Handlers get the request with a lazy [`body::Incoming`] and a scoped
//!   [`ClientChannel`] for interim (1xx) responses.
//!
//! ```no_run
//! use quay::{handler_fn, Body, Response, Router, Server};
//!
//! #[tokio::main]
//! async fn main() -> quay::Result<()> {
//!     let mut router = Router::new();
//!     router.get("/", handler_fn(|_req, _channel| async {
//!         Ok(Some(Response::new(Body::from("Hello!"))))
//!     }))?;
//!
//!     let listening = Server::new(router).bind("127.0.0.1:8080").await?;
//!     // ... later:
//!     listening.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! The server speaks HTTP/1.1 per RFC 9110/9112, with HTTP/1.0 request
//! compatibility. HTTP/2+, WebSocket upgrades and TLS are out of scope.

#[doc(hidden)]
pub use http;

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

pub use crate::error::{Error, Result};

pub mod body;
mod common;
mod config;
mod error;
mod event;
mod headers;
mod proto;
mod routing;
mod server;
mod service;

pub use crate::body::{Body, Incoming};
pub use crate::config::{MinVersion, ServerConfig};
pub use crate::event::{Event, Events, Subscriber};
pub use crate::proto::h1::exchange::ClientChannel;
pub use crate::routing::{PathParams, RouteError, Router};
pub use crate::server::{Listening, Server};
pub use crate::service::{
    after_fn, before_fn, handler_fn, AfterAction, AfterFn, BeforeAction, BeforeFn, BeforeOutcome,
    BoxError, BoxFuture, Chain, ErrorHandler, Handler, HandlerFn, HandlerResult, RequestExt,
    RequestHead,
};

impl From<RouteError> for Error {
    fn from(err: RouteError) -> Error {
        Error::new_user(crate::error::User::Handler).with(err)
    }
}
