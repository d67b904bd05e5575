//! URL construction helpers for forwarding requests to upstream backends.

/// Joins a backend base URL (e.g. `http://backend:8080`) with the matched
/// request path, producing the URL the `RouteProxy` dials.
///
/// # Examples
///
/// ```
/// use gateway_core::utils::path::join_backend_url;
///
/// assert_eq!(join_backend_url("http://api-server", "/v1/users/123"), "http://api-server/v1/users/123");
/// assert_eq!(join_backend_url("http://api-server/", "/v1/users/123"), "http://api-server/v1/users/123");
/// ```
pub fn join_backend_url(backend_url: &str, path: &str) -> String {
    let base = backend_url.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_without_double_slash() {
        assert_eq!(join_backend_url("http://b/", "/x"), "http://b/x");
        assert_eq!(join_backend_url("http://b", "/x"), "http://b/x");
    }
}
