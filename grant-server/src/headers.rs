use axum::response::Response;
use http::header::{CACHE_CONTROL, PRAGMA};
use http::HeaderValue;

/// Cache-Control directives for responses
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheControl {
    no_store: bool,
    public: bool,
    max_age: Option<u32>,
}

impl CacheControl {
    pub fn no_store() -> Self {
        Self {
            no_store: true,
            ..Self::default()
        }
    }

    pub fn public(max_age: u32) -> Self {
        Self {
            public: true,
            max_age: Some(max_age),
            ..Self::default()
        }
    }

    fn header_value(&self) -> HeaderValue {
        let mut parts = Vec::new();
        if self.no_store {
            parts.push("no-store".to_string());
        }
        if self.public {
            parts.push("public".to_string());
        }
        if let Some(max_age) = self.max_age {
            parts.push(format!("max-age={max_age}"));
        }
        HeaderValue::from_str(&parts.join(", ")).unwrap_or(HeaderValue::from_static("no-store"))
    }

    /// Set the directives on a response. Token responses also get
    /// `Pragma: no-cache` for HTTP/1.0 caches.
    pub fn apply(&self, response: &mut Response) {
        let headers = response.headers_mut();
        headers.insert(CACHE_CONTROL, self.header_value());
        if self.no_store {
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        }
    }
}
