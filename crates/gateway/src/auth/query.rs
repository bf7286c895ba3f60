// Bearer credential extraction from connection URIs.
//
// Browsers cannot set headers on a WebSocket handshake, so the credential
// travels in the `token` query parameter.

use axum::http::Uri;
use tandem_common::protocol::TOKEN_QUERY_PARAM;
use url::form_urlencoded;

/// Returns the first non-empty `token` query value, percent-decoded.
pub fn token_from_uri(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == TOKEN_QUERY_PARAM)
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
