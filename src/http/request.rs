//! Request handling and transformation.
//!
//! # Responsibilities
//! - Read the request ID assigned by `SetRequestIdLayer`
//! - Prepare inbound headers for forwarding to a backend
//!
//! # Design Decisions
//! - Hop-by-hop headers are never forwarded
//! - Identity headers are rewritten from the resolved identity, so a caller
//!   cannot forge them in token mode

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

use crate::config::IdentityConfig;
use crate::security::identity::Identity;

pub const X_REQUEST_ID: &str = "x-request-id";

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Headers to send to the backend for this request.
pub fn forwardable_headers(inbound: &HeaderMap, identity: &Identity, config: &IdentityConfig) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        if HOP_BY_HOP.contains(name) || name == header::CONTENT_LENGTH || name.as_str() == "keep-alive" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    for (name, value) in [
        (&config.user_header, &identity.user_id),
        (&config.tenant_header, &identity.tenant_id),
    ] {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}
