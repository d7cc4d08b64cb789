//! Small utilities over `HeaderMap` shared by the h1 protocol code.

use http::header::{HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};

pub(crate) fn connection_close(headers: &HeaderMap) -> bool {
    connection_has(headers, "close")
}

pub(crate) fn connection_keep_alive(headers: &HeaderMap) -> bool {
    connection_has(headers, "keep-alive")
}

fn connection_has(headers: &HeaderMap, needle: &str) -> bool {
    for value in headers.get_all(CONNECTION) {
        if let Ok(s) = value.to_str() {
            for token in s.split(',') {
                if token.trim().eq_ignore_ascii_case(needle) {
                    return true;
                }
            }
        }
    }
    false
}

/// Parses `Content-Length`, tolerating repeats that agree.
///
/// `Ok(None)` means absent; `Err(())` means present but invalid, including
/// differing repeated values.
pub(crate) fn content_length_parse(headers: &HeaderMap) -> Result<Option<u64>, ()> {
    let mut folded: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let n = parse_u64(value).ok_or(())?;
        match folded {
            Some(prev) if prev != n => return Err(()),
            _ => folded = Some(n),
        }
    }
    Ok(folded)
}

fn parse_u64(value: &HeaderValue) -> Option<u64> {
    let s = value.to_str().ok()?;
    // `parse` would tolerate a leading '+'.
    if s.is_empty() || !s.as_bytes().iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

pub(crate) fn transfer_encoding_present(headers: &HeaderMap) -> bool {
    headers.contains_key(TRANSFER_ENCODING)
}

/// Whether the final transfer coding is `chunked`.
pub(crate) fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    let mut values = headers.get_all(TRANSFER_ENCODING).into_iter();
    if let Some(last) = values.next_back() {
        if let Ok(s) = last.to_str() {
            if let Some(coding) = s.rsplit(',').next() {
                return coding.trim().eq_ignore_ascii_case("chunked");
            }
        }
    }
    false
}

pub(crate) fn expect_continue(headers: &HeaderMap) -> bool {
    match headers.get(http::header::EXPECT) {
        Some(value) => value
            .to_str()
            .map(|s| s.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false),
        None => false,
    }
}

/// Whether the request declared trailers via the `Trailer` header.
pub(crate) fn declares_trailers(headers: &HeaderMap) -> bool {
    headers.contains_key(http::header::TRAILER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn connection_tokens_are_case_insensitive_lists() {
        let headers = map(&[("connection", "Keep-Alive, Upgrade")]);
        assert!(connection_keep_alive(&headers));
        assert!(!connection_close(&headers));

        let headers = map(&[("connection", "CLOSE")]);
        assert!(connection_close(&headers));
    }

    #[test]
    fn content_length_repeats_must_agree() {
        let headers = map(&[("content-length", "5"), ("content-length", "5")]);
        assert_eq!(content_length_parse(&headers), Ok(Some(5)));

        let headers = map(&[("content-length", "10"), ("content-length", "11")]);
        assert_eq!(content_length_parse(&headers), Err(()));

        let headers = map(&[("content-length", "+5")]);
        assert_eq!(content_length_parse(&headers), Err(()));

        assert_eq!(content_length_parse(&HeaderMap::new()), Ok(None));
    }

    #[test]
    fn chunked_must_be_the_final_coding() {
        let headers = map(&[("transfer-encoding", "gzip, chunked")]);
        assert!(transfer_encoding_is_chunked(&headers));

        let headers = map(&[("transfer-encoding", "chunked, gzip")]);
        assert!(!transfer_encoding_is_chunked(&headers));

        let headers = map(&[
            ("transfer-encoding", "gzip"),
            ("transfer-encoding", "chunked"),
        ]);
        assert!(transfer_encoding_is_chunked(&headers));
    }

    #[test]
    fn expect_continue_matching() {
        assert!(expect_continue(&map(&[("expect", "100-continue")])));
        assert!(expect_continue(&map(&[("expect", "100-Continue")])));
        assert!(!expect_continue(&map(&[("expect", "nope")])));
        assert!(!expect_continue(&HeaderMap::new()));
    }
}
