// Helpers to strip hop-by-hop headers. The proxy applies them in both directions: requests
// from clients to upstreams, and responses coming back from upstreams to clients.

use http::header::{
    CONNECTION, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

const KEEP_ALIVE: &str = "keep-alive";
const PROXY_CONNECTION: &str = "proxy-connection";

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Returns the requested protocol when the message asks to switch protocols
/// (`Connection: upgrade` together with an `Upgrade` header).
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    if !connection_tokens(headers).iter().any(|t| t == "upgrade") {
        return None;
    }
    headers.get(UPGRADE).cloned()
}

// Hop-by-hop headers are removed before forwarding:
// - standard hop-by-hop headers, plus keep-alive and proxy-connection
// - any extra headers listed in the Connection header value
//
// HTTP/2 forbids connection-specific headers, so running the filter on those
// messages is a no-op in practice.
pub fn filter_hop_by_hop(headers: &mut HeaderMap) -> &mut HeaderMap {
    // Parse the Connection header to find additional headers to drop
    let extra_drops: Vec<HeaderName> = connection_tokens(headers)
        .into_iter()
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();

    for name in HOP_BY_HOP_NAMES {
        headers.remove(name);
    }
    headers.remove(KEEP_ALIVE);
    headers.remove(PROXY_CONNECTION);

    for name in extra_drops {
        headers.remove(&name);
    }

    headers
}

/// Restores the headers that carry a protocol switch after [`filter_hop_by_hop`].
pub fn set_upgrade_headers(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, protocol);
}
