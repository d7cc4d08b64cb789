//! The contracts between the exchange engine and application code:
//! handlers, before/after actions, and the error handler chain.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::header::HeaderMap;
use http::{Method, Request, Response, Uri, Version};

use crate::body::{Body, Incoming};
use crate::proto::h1::exchange::ClientChannel;
use crate::routing::PathParams;
use crate::Error;

/// Boxed error type accepted from application code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by the application contracts.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// What a handler resolves to: a final response, or `None` when the final
/// response was already written through the scoped channel.
pub type HandlerResult = std::result::Result<Option<Response<Body>>, BoxError>;

/// A request handler.
///
/// The handler receives the request (head, headers, lazy body, extensions)
/// and a [`ClientChannel`] scoped to this invocation. It either returns a
/// final response, returns `None` after writing one through the channel,
/// or fails; failures travel to the error handler chain.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request<Incoming>, channel: ClientChannel) -> BoxFuture<HandlerResult>;
}

impl Handler for Arc<dyn Handler> {
    fn call(&self, req: Request<Incoming>, channel: ClientChannel) -> BoxFuture<HandlerResult> {
        (**self).call(req, channel)
    }
}

/// Wraps an async closure as a [`Handler`].
///
/// ```
/// use quay::{handler_fn, Body, Response};
///
/// let handler = handler_fn(|_req, _channel| async {
///     Ok(Some(Response::new(Body::from("Hello!"))))
/// });
/// # drop(handler);
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<Incoming>, ClientChannel) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn { f }
}

/// A [`Handler`] backed by a closure, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request<Incoming>, ClientChannel) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, req: Request<Incoming>, channel: ClientChannel) -> BoxFuture<HandlerResult> {
        Box::pin((self.f)(req, channel))
    }
}

impl<F> std::fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerFn").finish()
    }
}

/// Outcome of a before-action.
pub enum BeforeOutcome {
    /// Continue the chain with the (possibly modified) request.
    Next(Request<Incoming>),
    /// Short-circuit: later before-actions and the handler are skipped;
    /// after-actions still run on this response.
    Respond(Request<Incoming>, Response<Body>),
}

/// A function invoked before the handler; it may mutate the request or
/// short-circuit with a response.
pub trait BeforeAction: Send + Sync + 'static {
    fn call(&self, req: Request<Incoming>)
        -> BoxFuture<std::result::Result<BeforeOutcome, BoxError>>;
}

/// Wraps an async closure as a [`BeforeAction`].
pub fn before_fn<F, Fut>(f: F) -> BeforeFn<F>
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<BeforeOutcome, BoxError>> + Send + 'static,
{
    BeforeFn { f }
}

/// A [`BeforeAction`] backed by a closure, see [`before_fn`].
pub struct BeforeFn<F> {
    f: F,
}

impl<F, Fut> BeforeAction for BeforeFn<F>
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<BeforeOutcome, BoxError>> + Send + 'static,
{
    fn call(
        &self,
        req: Request<Incoming>,
    ) -> BoxFuture<std::result::Result<BeforeOutcome, BoxError>> {
        Box::pin((self.f)(req))
    }
}

/// A function invoked after the handler; it may rewrite the response.
pub trait AfterAction: Send + Sync + 'static {
    fn call(
        &self,
        head: Arc<RequestHead>,
        res: Response<Body>,
    ) -> BoxFuture<std::result::Result<Response<Body>, BoxError>>;
}

/// Wraps an async closure as an [`AfterAction`].
pub fn after_fn<F, Fut>(f: F) -> AfterFn<F>
where
    F: Fn(Arc<RequestHead>, Response<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Response<Body>, BoxError>> + Send + 'static,
{
    AfterFn { f }
}

/// An [`AfterAction`] backed by a closure, see [`after_fn`].
pub struct AfterFn<F> {
    f: F,
}

impl<F, Fut> AfterAction for AfterFn<F>
where
    F: Fn(Arc<RequestHead>, Response<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Response<Body>, BoxError>> + Send + 'static,
{
    fn call(
        &self,
        head: Arc<RequestHead>,
        res: Response<Body>,
    ) -> BoxFuture<std::result::Result<Response<Body>, BoxError>> {
        Box::pin((self.f)(head, res))
    }
}

/// An immutable snapshot of the request head, available to after-actions
/// and error handlers even when the request itself is gone.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Handles errors surfaced by the engine or thrown by handlers.
///
/// A handler may produce a response, fall through with
/// [`Chain::proceed`], or fail to propagate.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, chain: Chain) -> BoxFuture<std::result::Result<Response<Body>, BoxError>>;
}

/// The rest of the error handler chain.
///
/// The last link is always the default handler, which maps the error
/// taxonomy to status codes.
pub struct Chain {
    error: Error,
    rest: VecDeque<Arc<dyn ErrorHandler>>,
    head: Option<Arc<RequestHead>>,
}

impl Chain {
    pub(crate) fn new(
        error: Error,
        handlers: &[Arc<dyn ErrorHandler>],
        head: Option<Arc<RequestHead>>,
    ) -> Chain {
        Chain {
            error,
            rest: handlers.iter().cloned().collect(),
            head,
        }
    }

    /// The error being handled.
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// The request head, absent when the head itself failed to parse.
    pub fn head(&self) -> Option<&RequestHead> {
        self.head.as_deref()
    }

    /// Passes the error on to the next handler in the chain.
    pub async fn proceed(mut self) -> std::result::Result<Response<Body>, BoxError> {
        match self.rest.pop_front() {
            Some(handler) => handler.handle(self).await,
            None => Ok(default_error_response(&self.error)),
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("error", &self.error)
            .field("remaining", &self.rest.len())
            .finish()
    }
}

/// The default error-to-response mapping.
pub(crate) fn default_error_response(error: &Error) -> Response<Body> {
    let status = error
        .status()
        .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    if let Some(allow) = error.allowed_methods() {
        if let Ok(value) = http::HeaderValue::from_str(&join_methods(allow)) {
            res.headers_mut().insert(http::header::ALLOW, value);
        }
    }
    if status == http::StatusCode::UPGRADE_REQUIRED {
        res.headers_mut()
            .insert(http::header::UPGRADE, http::HeaderValue::from_static("HTTP/1.1"));
    }
    res
}

pub(crate) fn join_methods(methods: &[Method]) -> String {
    let mut out = String::new();
    for method in methods {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(method.as_str());
    }
    out
}

/// Extension accessors on requests.
pub trait RequestExt {
    /// The parameters captured from the path by the matched route.
    fn path_params(&self) -> Option<&PathParams>;

    /// The value captured by `:name` in the matched route pattern.
    fn path_param(&self, name: &str) -> Option<&str>;
}

impl<B> RequestExt for Request<B> {
    fn path_params(&self) -> Option<&PathParams> {
        self.extensions().get::<PathParams>()
    }

    fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params().and_then(|params| params.get(name))
    }
}

/// Everything the exchange needs from the application: the routing table,
/// the action pipeline and the error handler chain.
pub(crate) struct App {
    router: std::sync::RwLock<Arc<crate::routing::Router>>,
    pub(crate) before: Vec<Arc<dyn BeforeAction>>,
    pub(crate) after: Vec<Arc<dyn AfterAction>>,
    pub(crate) error_handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl App {
    pub(crate) fn new(router: crate::routing::Router) -> App {
        App {
            router: std::sync::RwLock::new(Arc::new(router)),
            before: Vec::new(),
            after: Vec::new(),
            error_handlers: Vec::new(),
        }
    }

    /// Snapshot of the routing table; in-flight exchanges keep theirs.
    pub(crate) fn router(&self) -> Arc<crate::routing::Router> {
        Arc::clone(&self.router.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub(crate) fn set_router(&self, router: crate::routing::Router) {
        let mut guard = self.router.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(router);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BodyKind, RouteKind};

    #[test]
    fn default_maps_taxonomy_to_statuses() {
        let res = default_error_response(&Error::new_route(RouteKind::NotFound));
        assert_eq!(res.status(), http::StatusCode::NOT_FOUND);

        let res = default_error_response(&Error::new_body(BodyKind::ConflictingFraming));
        assert_eq!(res.status(), http::StatusCode::BAD_REQUEST);

        let res = default_error_response(&Error::new_idle_timeout());
        assert_eq!(res.status(), http::StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn method_not_allowed_carries_allow() {
        let err = Error::new_route(RouteKind::MethodNotAllowed(vec![
            Method::GET,
            Method::HEAD,
        ]));
        let res = default_error_response(&err);
        assert_eq!(res.headers().get(http::header::ALLOW).unwrap(), "GET, HEAD");
    }

    #[test]
    fn upgrade_required_names_the_protocol() {
        let err = Error::new_parse(crate::error::Parse::VersionTooOld);
        let res = default_error_response(&err);
        assert_eq!(res.status(), http::StatusCode::UPGRADE_REQUIRED);
        assert_eq!(res.headers().get(http::header::UPGRADE).unwrap(), "HTTP/1.1");
    }

    #[tokio::test]
    async fn chain_falls_through_to_the_default() {
        let chain = Chain::new(Error::new_route(RouteKind::NotFound), &[], None);
        let res = chain.proceed().await.unwrap();
        assert_eq!(res.status(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chain_runs_handlers_in_order() {
        struct Rewrites;
        impl ErrorHandler for Rewrites {
            fn handle(
                &self,
                chain: Chain,
            ) -> BoxFuture<std::result::Result<Response<Body>, BoxError>> {
                Box::pin(async move {
                    if chain.error().is_routing() {
                        let mut res = Response::new(Body::from("custom not found"));
                        *res.status_mut() = http::StatusCode::NOT_FOUND;
                        Ok(res)
                    } else {
                        chain.proceed().await
                    }
                })
            }
        }

        let handlers: Vec<Arc<dyn ErrorHandler>> = vec![Arc::new(Rewrites)];
        let chain = Chain::new(Error::new_route(RouteKind::NotFound), &handlers, None);
        let res = chain.proceed().await.unwrap();
        assert_eq!(res.status(), http::StatusCode::NOT_FOUND);
    }
}
