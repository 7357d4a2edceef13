use axum::http::{HeaderMap, HeaderName, HeaderValue};
use rusty_relay_messages::Headers;
use std::{fmt::Display, str::FromStr, time::Duration};

/// Hop-by-hop headers that must not travel through the relay.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn from_env_or_else<T, F>(key: &str, f: F) -> T
where
    T: FromStr + Display,
    F: FnOnce() -> T,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_else(f)
}

pub fn duration_from_env_ms(key: &str, default: Duration) -> Duration {
    Duration::from_millis(from_env_or_else(key, || default.as_millis() as u64))
}

pub fn generate_id(length: usize) -> String {
    nanoid::nanoid!(length, &nanoid::alphabet::SAFE[2..])
}

/// Ids end up in file names and URL paths, so only the nanoid alphabet is allowed.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn into_headers(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter(|(k, _)| !HOP_BY_HOP.contains(&k.as_str()))
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect()
}

pub fn into_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers.iter() {
        if HOP_BY_HOP.contains(&k.to_ascii_lowercase().as_str()) {
            continue;
        }
        match (k.parse::<HeaderName>(), v.parse::<HeaderValue>()) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::debug!("dropping invalid header: {k}"),
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_headers_keeps_multi_values() {
        let mut map = HeaderMap::new();
        map.append("accept", "text/html".parse().unwrap());
        map.append("accept", "text/plain".parse().unwrap());
        map.insert("connection", "keep-alive".parse().unwrap());

        let headers = into_headers(&map);
        assert_eq!(headers.get_all("Accept"), ["text/html", "text/plain"]);
        assert!(!headers.contains("connection"));

        let back = into_header_map(&headers);
        assert_eq!(back.get_all("accept").iter().count(), 2);
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id(&generate_id(20)));
        assert!(!is_valid_id("../etc/passwd"));
        assert!(!is_valid_id(""));
    }
}
