//! Path pattern grammar: `/` separated segments that are literal text,
//! a named single-segment capture (`:name`), or a tail wildcard (`*`).

use std::fmt;

use super::RouteError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

/// Splits a request path into its non-empty segments.
///
/// Empty segments collapse, so `//a///b` and `/a/b` are the same path.
pub(crate) fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl PathPattern {
    pub(crate) fn parse(pattern: &str) -> Result<PathPattern, RouteError> {
        if !pattern.starts_with('/') {
            return Err(RouteError::invalid_pattern(
                pattern,
                "pattern must begin with '/'",
            ));
        }

        let mut segments = Vec::new();
        let mut names: Vec<&str> = Vec::new();
        let raw_segments = path_segments(pattern);
        let last = raw_segments.len().saturating_sub(1);

        for (i, raw) in raw_segments.iter().enumerate() {
            let segment = if let Some(name) = raw.strip_prefix(':') {
                if name.is_empty() {
                    return Err(RouteError::invalid_pattern(
                        pattern,
                        "':' must be followed by a parameter name",
                    ));
                }
                if names.contains(&name) {
                    return Err(RouteError::invalid_pattern(
                        pattern,
                        "duplicate parameter name",
                    ));
                }
                names.push(name);
                Segment::Param(name.to_string())
            } else if *raw == "*" {
                if i != last {
                    return Err(RouteError::invalid_pattern(
                        pattern,
                        "'*' is only allowed as the last segment",
                    ));
                }
                Segment::Wildcard
            } else if raw.contains(':') || raw.contains('*') {
                return Err(RouteError::invalid_pattern(
                    pattern,
                    "':' and '*' cannot appear inside a literal segment",
                ));
            } else {
                Segment::Literal(raw.to_string())
            };
            segments.push(segment);
        }

        Ok(PathPattern {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.raw
    }

    /// Matches the path segments, producing captured parameters.
    ///
    /// The tail wildcard matches zero or more remaining segments; its
    /// capture is available under the name `*`.
    pub(crate) fn matches(&self, path: &[&str]) -> Option<Vec<(String, String)>> {
        let mut params = Vec::new();
        let mut i = 0;

        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    if path.get(i).copied() != Some(lit.as_str()) {
                        return None;
                    }
                    i += 1;
                }
                Segment::Param(name) => {
                    let value = path.get(i)?;
                    params.push((name.clone(), (*value).to_string()));
                    i += 1;
                }
                Segment::Wildcard => {
                    params.push(("*".to_string(), path[i..].join("/")));
                    return Some(params);
                }
            }
        }

        if i == path.len() {
            Some(params)
        } else {
            None
        }
    }

    /// Ranking key for resolution: literal segments beat parameters, which
    /// beat the wildcard, position by position.
    pub(crate) fn rank(&self) -> Vec<u8> {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(_) => 2,
                Segment::Param(_) => 1,
                Segment::Wildcard => 0,
            })
            .collect()
    }

    /// Whether some request path could match both patterns.
    pub(crate) fn overlaps(&self, other: &PathPattern) -> bool {
        let mut a = self.segments.iter();
        let mut b = other.segments.iter();
        loop {
            match (a.next(), b.next()) {
                (Some(Segment::Wildcard), _) | (_, Some(Segment::Wildcard)) => return true,
                (None, None) => return true,
                (None, Some(_)) | (Some(_), None) => return false,
                (Some(Segment::Literal(x)), Some(Segment::Literal(y))) => {
                    if x != y {
                        return false;
                    }
                }
                // a parameter overlaps any single segment
                (Some(_), Some(_)) => {}
            }
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str) -> PathPattern {
        PathPattern::parse(p).unwrap()
    }

    fn matches(p: &str, path: &str) -> Option<Vec<(String, String)>> {
        pattern(p).matches(&path_segments(path))
    }

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(matches("/", "/").is_some());
        assert!(matches("/hello", "/hello").is_some());
        assert!(matches("/hello", "/hello/").is_some());
        assert!(matches("/hello", "/world").is_none());
        assert!(matches("/hello", "/hello/world").is_none());
        assert!(matches("/a/b", "/a//b").is_some(), "empty segments collapse");
    }

    #[test]
    fn params_capture_single_segments() {
        let params = matches("/hello/:name", "/hello/John").unwrap();
        assert_eq!(params, [("name".to_string(), "John".to_string())]);
        assert!(matches("/hello/:name", "/hello").is_none());
        assert!(matches("/hello/:name", "/hello/a/b").is_none());
    }

    #[test]
    fn wildcard_captures_the_tail() {
        let params = matches("/static/*", "/static/css/site.css").unwrap();
        assert_eq!(params, [("*".to_string(), "css/site.css".to_string())]);
        assert!(matches("/static/*", "/static").is_some());
        assert!(matches("/static/*", "/other").is_none());
    }

    #[test]
    fn parse_is_deterministic_and_strict() {
        assert!(PathPattern::parse("no-slash").is_err());
        assert!(PathPattern::parse("/a/:").is_err());
        assert!(PathPattern::parse("/a/*/b").is_err());
        assert!(PathPattern::parse("/a/x*y").is_err());
        assert!(PathPattern::parse("/:x/:x").is_err());
        assert_eq!(pattern("/a/:b/*"), pattern("/a/:b/*"));
    }

    #[test]
    fn literal_outranks_param_outranks_wildcard() {
        let lit = pattern("/a/b").rank();
        let par = pattern("/a/:x").rank();
        let wild = pattern("/a/*").rank();
        assert!(lit > par);
        assert!(par > wild);
    }

    #[test]
    fn overlap_detection() {
        assert!(pattern("/a/b").overlaps(&pattern("/a/:x")));
        assert!(pattern("/a/:x").overlaps(&pattern("/a/:y")));
        assert!(pattern("/a/*").overlaps(&pattern("/a/b/c")));
        assert!(!pattern("/a/b").overlaps(&pattern("/a/c")));
        assert!(!pattern("/a").overlaps(&pattern("/a/b")));
    }
}
