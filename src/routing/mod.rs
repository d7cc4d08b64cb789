//! Routing table: registering routes and resolving requests to handlers.
//!
//! A route is a path pattern plus a set of handlers keyed by method and
//! media types. Registration is strict (duplicates and overlaps are
//! rejected up front); resolution picks the most specific pattern and the
//! best media-type match, and treats remaining ties as errors.

pub(crate) mod media;
pub(crate) mod pattern;

use std::fmt;
use std::sync::Arc;

use http::header::HeaderMap;
use http::Method;
use mime::Mime;

use self::pattern::{path_segments, PathPattern};
use crate::error::RouteKind;
use crate::service::Handler;
use crate::Error;

/// Parameters captured from the request path by the matched pattern.
///
/// Available to handlers through the request extensions; the tail captured
/// by a `*` pattern is stored under the name `*`.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    params: Vec<(String, String)>,
}

impl PathParams {
    pub(crate) fn new(params: Vec<(String, String)>) -> PathParams {
        PathParams { params }
    }

    /// The value captured by `:name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// The tail captured by a trailing `*`.
    pub fn wildcard(&self) -> Option<&str> {
        self.get("*")
    }

    /// All captures in pattern order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// An error rejecting a route registration.
#[derive(Debug)]
pub struct RouteError {
    pattern: String,
    msg: String,
}

impl RouteError {
    fn invalid_pattern(pattern: &str, msg: &'static str) -> RouteError {
        RouteError {
            pattern: pattern.to_string(),
            msg: msg.to_string(),
        }
    }

    fn duplicate(pattern: &str, method: &Method) -> RouteError {
        RouteError {
            pattern: pattern.to_string(),
            msg: format!("duplicate registration for {}", method),
        }
    }

    fn overlap(pattern: &str, other: &str, method: &Method) -> RouteError {
        RouteError {
            pattern: pattern.to_string(),
            msg: format!("overlaps {} for {} without differing media types", other, method),
        }
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route {:?}: {}", self.pattern, self.msg)
    }
}

impl std::error::Error for RouteError {}

pub(crate) struct Endpoint {
    method: Method,
    consumes: Mime,
    produces: Mime,
    handler: Arc<dyn Handler>,
}

struct Route {
    pattern: PathPattern,
    endpoints: Vec<Endpoint>,
}

/// The routing table.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

pub(crate) struct Resolved {
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) params: PathParams,
}

pub(crate) enum Resolution {
    Handler(Resolved),
    /// `OPTIONS` on a matched route with no explicit handler.
    DefaultOptions { allow: Vec<Method> },
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    /// Registers a handler for `method` on `pattern`, consuming and
    /// producing any media type.
    pub fn route<H>(&mut self, method: Method, pattern: &str, handler: H) -> Result<&mut Self, RouteError>
    where
        H: Handler,
    {
        self.route_with(method, pattern, mime::STAR_STAR, mime::STAR_STAR, handler)
    }

    /// Registers a handler constrained by `consumes` (matched against the
    /// request `Content-Type`) and `produces` (matched against `Accept`).
    pub fn route_with<H>(
        &mut self,
        method: Method,
        pattern: &str,
        consumes: Mime,
        produces: Mime,
        handler: H,
    ) -> Result<&mut Self, RouteError>
    where
        H: Handler,
    {
        let parsed = PathPattern::parse(pattern)?;
        let endpoint = Endpoint {
            method,
            consumes,
            produces,
            handler: Arc::new(handler),
        };

        for route in &self.routes {
            if route.pattern == parsed {
                for existing in &route.endpoints {
                    if existing.method == endpoint.method
                        && existing.consumes == endpoint.consumes
                        && existing.produces == endpoint.produces
                    {
                        return Err(RouteError::duplicate(pattern, &endpoint.method));
                    }
                }
            } else if route.pattern.overlaps(&parsed) {
                for existing in &route.endpoints {
                    if existing.method == endpoint.method
                        && existing.consumes == endpoint.consumes
                        && existing.produces == endpoint.produces
                    {
                        return Err(RouteError::overlap(
                            pattern,
                            route.pattern.as_str(),
                            &endpoint.method,
                        ));
                    }
                }
            }
        }

        match self.routes.iter_mut().find(|r| r.pattern == parsed) {
            Some(route) => route.endpoints.push(endpoint),
            None => self.routes.push(Route {
                pattern: parsed,
                endpoints: vec![endpoint],
            }),
        }
        Ok(self)
    }

    pub fn get<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route(Method::GET, pattern, handler)
    }

    pub fn post<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route(Method::POST, pattern, handler)
    }

    pub fn put<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route(Method::PUT, pattern, handler)
    }

    pub fn delete<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route(Method::DELETE, pattern, handler)
    }

    pub fn head<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route(Method::HEAD, pattern, handler)
    }

    pub fn options<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route(Method::OPTIONS, pattern, handler)
    }

    pub fn trace<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route(Method::TRACE, pattern, handler)
    }

    pub fn connect<H: Handler>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouteError> {
        self.route(Method::CONNECT, pattern, handler)
    }

    /// Resolves a request to a handler, or to the error describing why
    /// none fits.
    pub(crate) fn resolve(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> crate::Result<Resolution> {
        let segments = path_segments(path);

        // most specific pattern wins; a tie between distinct routes is an
        // ambiguity error
        let mut best: Option<(&Route, Vec<(String, String)>, Vec<u8>)> = None;
        let mut tied = false;
        for route in &self.routes {
            let Some(params) = route.pattern.matches(&segments) else {
                continue;
            };
            let rank = route.pattern.rank();
            match &best {
                Some((_, _, best_rank)) => {
                    if rank > *best_rank {
                        best = Some((route, params, rank));
                        tied = false;
                    } else if rank == *best_rank {
                        tied = true;
                    }
                }
                None => best = Some((route, params, rank)),
            }
        }

        let Some((route, params, _)) = best else {
            return Err(Error::new_route(RouteKind::NotFound));
        };
        if tied {
            return Err(Error::new_route(RouteKind::Ambiguous));
        }

        let candidates: Vec<&Endpoint> = route
            .endpoints
            .iter()
            .filter(|e| e.method == *method)
            .collect();

        if candidates.is_empty() {
            let mut allow: Vec<Method> = Vec::new();
            for endpoint in &route.endpoints {
                if !allow.contains(&endpoint.method) {
                    allow.push(endpoint.method.clone());
                }
            }
            return if *method == Method::OPTIONS {
                Ok(Resolution::DefaultOptions { allow })
            } else {
                Err(Error::new_route(RouteKind::MethodNotAllowed(allow)))
            };
        }

        let content_type = media::content_type(headers);
        let consuming: Vec<&Endpoint> = candidates
            .into_iter()
            .filter(|e| media::consumes_matches(&e.consumes, content_type.as_ref()))
            .collect();
        if consuming.is_empty() {
            return Err(Error::new_route(RouteKind::MediaTypeUnsupported));
        }

        let accept = media::parse_accept(headers);
        let mut scored: Vec<(&Endpoint, (u8, u16, u8, u8))> = Vec::new();
        for endpoint in consuming {
            if let Some((q, accept_spec)) = media::accept_score(&endpoint.produces, &accept) {
                let score = (
                    media::specificity(&endpoint.consumes),
                    q,
                    accept_spec,
                    media::specificity(&endpoint.produces),
                );
                scored.push((endpoint, score));
            }
        }
        if scored.is_empty() {
            return Err(Error::new_route(RouteKind::MediaTypeNotAccepted));
        }

        let best_score = scored.iter().map(|(_, s)| *s).max().expect("non-empty");
        let mut winners = scored.into_iter().filter(|(_, s)| *s == best_score);
        let (endpoint, _) = winners.next().expect("non-empty");
        if winners.next().is_some() {
            return Err(Error::new_route(RouteKind::Ambiguous));
        }

        Ok(Resolution::Handler(Resolved {
            handler: Arc::clone(&endpoint.handler),
            params: PathParams::new(params),
        }))
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let patterns: Vec<&str> = self.routes.iter().map(|r| r.pattern.as_str()).collect();
        f.debug_struct("Router").field("routes", &patterns).finish()
    }
}
