//! Conversion between NATS header maps and broker headers.

use async_nats::HeaderMap;
use broker::Headers;

/// Copy every header value, keeping the per-key order.
pub fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, values) in map.iter() {
        headers
            .entry(name.to_string())
            .or_default()
            .extend(values.iter().map(|v| v.as_str().to_owned()));
    }
    headers
}

/// Build a header map, appending values in order.
pub fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, values) in headers {
        for value in values {
            map.append(key.as_str(), value.as_str());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_keeps_every_value_in_order() {
        let mut headers = Headers::new();
        headers.insert("x-route".into(), vec!["a".into(), "b".into(), "c".into()]);
        headers.insert("x-tenant".into(), vec!["acme".into()]);

        let map = to_header_map(&headers);
        assert_eq!(from_header_map(&map), headers);
    }

    #[test]
    fn test_from_native_map() {
        let mut map = HeaderMap::new();
        map.append("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01");
        map.append("x-retry", "1");
        map.append("x-retry", "2");

        let headers = from_header_map(&map);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["x-retry"], vec!["1", "2"]);
        assert!(headers["traceparent"][0].starts_with("00-4bf92f35"));
    }

    #[test]
    fn test_empty() {
        assert!(from_header_map(&HeaderMap::new()).is_empty());
        assert!(from_header_map(&to_header_map(&Headers::new())).is_empty());
    }
}
