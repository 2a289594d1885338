// Pluggable authentication for control-stream handshakes.
//
// The registry is built at server start and handed to the control-stream
// handler as an explicit dependency; there is no process-wide state.
use rill_metadata::Md;
use std::collections::HashMap;
use std::sync::Arc;

/// A named credential verifier.
///
/// `authenticate` receives the opaque payload from the Authentication frame
/// and returns connection metadata plus a pass/fail verdict.
pub trait AuthScheme: Send + Sync {
    fn name(&self) -> &str;
    fn authenticate(&self, payload: &str) -> (Option<Md>, bool);
}

/// Scheme-name -> verifier lookup, write-once at startup.
#[derive(Clone, Default)]
pub struct AuthRegistry {
    schemes: HashMap<String, Arc<dyn AuthScheme>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: Arc<dyn AuthScheme>) {
        self.schemes.insert(scheme.name().to_string(), scheme);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn AuthScheme>> {
        self.schemes.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty()
    }
}

/// Verify an Authentication frame against the registry.
///
/// An empty registry accepts everything: the deployment has opted out of
/// authentication. A missing frame or an unknown scheme name fails.
pub fn authenticate(registry: &AuthRegistry, frame: Option<(&str, &str)>) -> (Option<Md>, bool) {
    if registry.is_empty() {
        return (None, true);
    }
    let Some((auth_name, auth_payload)) = frame else {
        return (None, false);
    };
    match registry.get(auth_name) {
        Some(scheme) => scheme.authenticate(auth_payload),
        None => (None, false),
    }
}

/// Client credential parsed from a `name:payload` string.
///
/// ```
/// use rill_auth::Credential;
///
/// let cred = Credential::parse("token:a:b:c");
/// assert_eq!(cred.name(), "token");
/// assert_eq!(cred.payload(), "a:b:c");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    name: String,
    payload: String,
}

impl Credential {
    /// Split on the first `:`; absent colon yields the `none` sentinel.
    pub fn parse(input: &str) -> Self {
        match input.split_once(':') {
            Some((name, payload)) => Self {
                name: name.to_string(),
                payload: payload.to_string(),
            },
            None => Self {
                name: "none".to_string(),
                payload: String::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }
}

/// Shared-token scheme: accepts payloads equal to the configured token.
pub struct TokenScheme {
    token: String,
}

impl TokenScheme {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthScheme for TokenScheme {
    fn name(&self) -> &str {
        "token"
    }

    fn authenticate(&self, payload: &str) -> (Option<Md>, bool) {
        if payload == self.token {
            (Some(Md::new()), true)
        } else {
            (None, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectAll;

    impl AuthScheme for RejectAll {
        fn name(&self) -> &str {
            "basic"
        }

        fn authenticate(&self, _payload: &str) -> (Option<Md>, bool) {
            (None, false)
        }
    }

    #[test]
    fn empty_registry_accepts() {
        let registry = AuthRegistry::new();
        let (md, ok) = authenticate(&registry, Some(("anything", "x")));
        assert!(ok);
        assert!(md.is_none());
    }

    #[test]
    fn missing_frame_fails_when_registry_nonempty() {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(TokenScheme::new("secret")));
        let (_, ok) = authenticate(&registry, None);
        assert!(!ok);
    }

    #[test]
    fn unknown_scheme_fails() {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(TokenScheme::new("secret")));
        let (_, ok) = authenticate(&registry, Some(("basic", "x")));
        assert!(!ok);
    }

    #[test]
    fn token_scheme_verdicts() {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(TokenScheme::new("secret")));
        let (md, ok) = authenticate(&registry, Some(("token", "secret")));
        assert!(ok);
        assert!(md.is_some());
        let (_, ok) = authenticate(&registry, Some(("token", "wrong")));
        assert!(!ok);
    }

    #[test]
    fn registered_scheme_verdict_is_returned_verbatim() {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(RejectAll));
        let (md, ok) = authenticate(&registry, Some(("basic", "x")));
        assert!(!ok);
        assert!(md.is_none());
    }

    #[test]
    fn credential_splits_on_first_colon() {
        let cred = Credential::parse("token:pay:load");
        assert_eq!(cred.name(), "token");
        assert_eq!(cred.payload(), "pay:load");
    }

    #[test]
    fn credential_without_colon_is_none() {
        let cred = Credential::parse("justaname");
        assert_eq!(cred.name(), "none");
        assert_eq!(cred.payload(), "");
    }

    #[test]
    fn credential_with_empty_payload() {
        let cred = Credential::parse("token:");
        assert_eq!(cred.name(), "token");
        assert_eq!(cred.payload(), "");
    }
}
