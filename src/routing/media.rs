//! Media-type dispatch: matching `Content-Type` against a handler's
//! `consumes` constraint and the `Accept` header against `produces`.

use http::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use mime::Mime;

/// Quality values are kept in thousandths to stay orderable.
pub(crate) const Q_MAX: u16 = 1000;

/// The request's `Content-Type`, when present and well formed.
pub(crate) fn content_type(headers: &HeaderMap) -> Option<Mime> {
    headers
        .get(CONTENT_TYPE)?
        .to_str()
        .ok()?
        .parse::<Mime>()
        .ok()
}

/// Parses the `Accept` header into media ranges with quality values.
///
/// An explicit `q` takes precedence; an unspecified `q` is 1.0. An empty
/// result means the client accepts anything.
pub(crate) fn parse_accept(headers: &HeaderMap) -> Vec<(Mime, u16)> {
    let mut ranges = Vec::new();
    for value in headers.get_all(ACCEPT) {
        let Ok(s) = value.to_str() else { continue };
        for item in s.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let Ok(mime) = item.parse::<Mime>() else {
                continue;
            };
            let q = mime
                .get_param("q")
                .and_then(|v| v.as_str().parse::<f32>().ok())
                .map(|q| (q.clamp(0.0, 1.0) * Q_MAX as f32) as u16)
                .unwrap_or(Q_MAX);
            ranges.push((mime, q));
        }
    }
    ranges
}

/// Whether two media ranges can describe the same concrete type.
pub(crate) fn compatible(a: &Mime, b: &Mime) -> bool {
    let type_ok = a.type_() == mime::STAR || b.type_() == mime::STAR || a.type_() == b.type_();
    let subtype_ok =
        a.subtype() == mime::STAR || b.subtype() == mime::STAR || a.subtype() == b.subtype();
    type_ok && subtype_ok
}

/// How specific a media range is: `*/*` < `type/*` < `type/subtype`.
pub(crate) fn specificity(m: &Mime) -> u8 {
    if m.type_() == mime::STAR {
        0
    } else if m.subtype() == mime::STAR {
        1
    } else {
        2
    }
}

/// Whether a handler's `consumes` constraint accepts the request media
/// type. An absent `Content-Type` satisfies any constraint.
pub(crate) fn consumes_matches(constraint: &Mime, content_type: Option<&Mime>) -> bool {
    match content_type {
        Some(ct) => compatible(constraint, ct),
        None => true,
    }
}

/// Scores a handler's `produces` constraint against the parsed `Accept`
/// ranges: `(q, accept specificity)`, the higher the better. `None` means
/// not acceptable.
pub(crate) fn accept_score(produces: &Mime, accept: &[(Mime, u16)]) -> Option<(u16, u8)> {
    if accept.is_empty() {
        return Some((Q_MAX, 0));
    }
    let mut best: Option<(u16, u8)> = None;
    for (range, q) in accept {
        if *q == 0 || !compatible(produces, range) {
            continue;
        }
        let score = (*q, specificity(range));
        if best.map_or(true, |b| score > b) {
            best = Some(score);
        }
    }
    best
}
