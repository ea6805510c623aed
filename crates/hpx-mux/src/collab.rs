//! Collaborators supplied by the host application.

use std::fmt;

/// Turns an endpoint path into a fully qualified socket URL.
pub trait UrlResolver: Send + Sync + 'static {
    /// Resolve `path` (e.g. `/ws/metrics`) to a `ws://` or `wss://` URL.
    fn resolve(&self, path: &str) -> String;
}

impl<F> UrlResolver for F
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    fn resolve(&self, path: &str) -> String {
        self(path)
    }
}

/// Resolves every path against a fixed base such as `wss://host:port`.
#[derive(Clone, Debug)]
pub struct BaseUrl(String);

impl BaseUrl {
    /// Base URL without a trailing slash.
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        while base.ends_with('/') {
            base.pop();
        }
        Self(base)
    }
}

impl UrlResolver for BaseUrl {
    fn resolve(&self, path: &str) -> String {
        format!("{}{path}", self.0)
    }
}

/// Source of the bearer credential sent after every open.
pub trait CredentialProvider: Send + Sync + 'static {
    /// Whether the caller currently holds a session.
    fn is_authenticated(&self) -> bool;

    /// The current bearer credential.
    fn token(&self) -> Option<String>;
}

/// Never authenticated.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn is_authenticated(&self) -> bool {
        false
    }

    fn token(&self) -> Option<String> {
        None
    }
}

/// A fixed token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

impl CredentialProvider for StaticToken {
    fn is_authenticated(&self) -> bool {
        !self.0.is_empty()
    }

    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_joins_paths() {
        let resolver = BaseUrl::new("wss://console.example:8443/");
        assert_eq!(
            resolver.resolve("/ws/terminal?id=t1"),
            "wss://console.example:8443/ws/terminal?id=t1"
        );
    }

    #[test]
    fn test_closure_resolver() {
        let resolver = |path: &str| format!("ws://localhost{path}");
        assert_eq!(resolver.resolve("/ws/events"), "ws://localhost/ws/events");
    }

    #[test]
    fn test_credentials() {
        assert!(!NoCredentials.is_authenticated());
        let token = StaticToken::new("abc");
        assert!(token.is_authenticated());
        assert_eq!(token.token().as_deref(), Some("abc"));
        assert_eq!(format!("{token:?}"), "StaticToken(..)");
    }
}
