//! Typed dispatch requests.

use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, Method};
use serde_json::Value;

use crate::cache::cache_key;
use crate::dispatch::error::DispatchError;

/// How a response may be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub tags: Vec<String>,
}

/// Fan-out performed after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub tenant_id: String,
    pub topic: String,
    pub event: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub cache: Option<CachePolicy>,
    pub invalidate_tags: Vec<String>,
    pub notify: Option<Notify>,
    pub timeout: Option<Duration>,
    /// Partition for cache keys, typically the tenant.
    pub cache_scope: Option<String>,
}

impl DispatchOptions {
    pub fn cached(mut self, ttl: Duration, tags: Vec<String>) -> Self {
        self.cache = Some(CachePolicy { ttl, tags });
        self
    }

    pub fn invalidating(mut self, tags: Vec<String>) -> Self {
        self.invalidate_tags = tags;
        self
    }

    pub fn notifying(mut self, notify: Notify) -> Self {
        self.notify = Some(notify);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn scoped_to(mut self, scope: impl Into<String>) -> Self {
        self.cache_scope = Some(scope.into());
        self
    }
}

/// One logical call to a named backend.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub backend: String,
    pub method: Method,
    /// Path and query, relative to the backend's base URL.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    options: DispatchOptions,
}

impl DispatchRequest {
    /// Build a request. Caching is only allowed for GET and HEAD.
    pub fn new(
        backend: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        options: DispatchOptions,
    ) -> Result<Self, DispatchError> {
        if options.cache.is_some() && !matches!(method, Method::GET | Method::HEAD) {
            return Err(DispatchError::InvalidOptions(format!(
                "{} responses cannot be cached",
                method
            )));
        }
        let path = path.into();
        let path = if path.starts_with('/') { path } else { format!("/{}", path) };
        Ok(Self {
            backend: backend.into(),
            method,
            path,
            headers,
            body,
            options,
        })
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// Stable cache key over backend, path, method and canonical body.
    pub fn cache_key(&self) -> String {
        let body = if self.body.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice::<Value>(&self.body)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&self.body).into_owned())),
            )
        };
        let backend = match &self.options.cache_scope {
            Some(scope) => format!("{}@{}", self.backend, scope),
            None => self.backend.clone(),
        };
        cache_key(&backend, &self.path, self.method.as_str(), body.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: Method, body: &'static [u8], options: DispatchOptions) -> Result<DispatchRequest, DispatchError> {
        DispatchRequest::new("users", method, "users/1", HeaderMap::new(), Bytes::from_static(body), options)
    }

    #[test]
    fn test_cacheable_write_rejected() {
        let options = DispatchOptions::default().cached(Duration::from_secs(30), vec![]);
        let err = request(Method::POST, b"{}", options.clone()).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidOptions(_)));
        assert!(request(Method::GET, b"", options.clone()).is_ok());
        assert!(request(Method::HEAD, b"", options).is_ok());
    }

    #[test]
    fn test_path_normalized() {
        let req = request(Method::GET, b"", DispatchOptions::default()).unwrap();
        assert_eq!(req.path, "/users/1");
        assert!(!req.is_write());
    }

    #[test]
    fn test_cache_key_uses_canonical_body() {
        let a = request(Method::GET, br#"{"a":1,"b":2}"#, DispatchOptions::default()).unwrap();
        let b = request(Method::GET, br#"{ "b": 2, "a": 1 }"#, DispatchOptions::default()).unwrap();
        let c = request(Method::GET, br#"{"a":2}"#, DispatchOptions::default()).unwrap();
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
    }

    #[test]
    fn test_cache_key_scoped_per_tenant() {
        let acme = request(Method::GET, b"", DispatchOptions::default().scoped_to("acme")).unwrap();
        let globex = request(Method::GET, b"", DispatchOptions::default().scoped_to("globex")).unwrap();
        let unscoped = request(Method::GET, b"", DispatchOptions::default()).unwrap();
        assert_ne!(acme.cache_key(), globex.cache_key());
        assert_ne!(acme.cache_key(), unscoped.cache_key());
    }
}
