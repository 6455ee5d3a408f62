use rustc_hash::FxHashMap;

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub subject: String,
}

/// Turns a presented credential into a session. Issuing credentials is out of scope.
#[async_trait::async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, credential: Option<&str>) -> Option<Session>;
}

/// Accepts every caller; for local use.
#[derive(Debug, Clone, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl SessionVerifier for AllowAll {
    async fn verify(&self, _credential: Option<&str>) -> Option<Session> {
        Some(Session { subject: "anonymous".into() })
    }
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: FxHashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, subject: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), subject.into());
        self
    }

    /// Parse `token=subject` pairs separated by commas, as in `STRATA_AUTH_TOKENS`.
    /// A bare token maps to subject `token`.
    pub fn parse(spec: &str) -> Self {
        let tokens = spec
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((t, s)) => (t.trim().to_string(), s.trim().to_string()),
                None => (pair.to_string(), "token".to_string()),
            })
            .collect();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait::async_trait]
impl SessionVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: Option<&str>) -> Option<Session> {
        let token = bearer_token(credential?)?;
        self.tokens.get(token).map(|subject| Session { subject: subject.clone() })
    }
}

/// Credential from an `Authorization` value, with or without a `Bearer` prefix.
pub fn bearer_token(value: &str) -> Option<&str> {
    let value = value.trim();
    let token = match value.strip_prefix("Bearer") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
        _ => value,
    };
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_tokens() {
        let v = StaticTokenVerifier::parse("abc=alice, def ,");
        assert_eq!(v.len(), 2);
        assert_eq!(v.verify(Some("Bearer abc")).await.map(|s| s.subject), Some("alice".into()));
        assert_eq!(v.verify(Some("def")).await.map(|s| s.subject), Some("token".into()));
        assert!(v.verify(Some("nope")).await.is_none());
        assert!(v.verify(None).await.is_none());
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer  xyz "), Some("xyz"));
        assert_eq!(bearer_token("xyz"), Some("xyz"));
        assert_eq!(bearer_token("Bearer "), None);
    }
}
