//! Per-backend credential resolution and injection.
//!
//! Each backend declares its credentials as templates in its `headers` (HTTP)
//! or `env` (stdio/container) maps, e.g. `Authorization: Bearer ${GITHUB_TOKEN}`.
//! The broker resolves every template once at startup into a [`CredentialSet`]
//! bound to exactly one backend. Transports own their set and never see
//! another backend's.
//!
//! Resolved values never reach logs: [`Credential`] redacts itself in both
//! `Debug` and `Display`.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use gantry_types::config::BackendSpec;
use gantry_types::errors::GatewayError;

/// Template placeholder syntax: `${NAME}`.
const TEMPLATE_PATTERN: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}";

/// A resolved secret value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext value, for the transport boundary only.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&redact(&self.0))
    }
}

/// Redact a secret for display, keeping a scheme prefix like `Bearer`.
pub fn redact(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, _)) if !scheme.is_empty() && scheme.len() <= 10 => {
            format!("{scheme} [REDACTED]")
        }
        _ => "[REDACTED]".to_string(),
    }
}

/// Resolved credentials for one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    backend: String,
    headers: BTreeMap<String, Credential>,
    env: BTreeMap<String, Credential>,
}

impl CredentialSet {
    /// An empty set bound to `backend`.
    pub fn empty(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Default::default()
        }
    }

    /// Name of the backend these credentials belong to.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Header name/value pairs for HTTP requests.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.expose()))
    }

    /// Environment variable pairs for process spawn.
    pub fn env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().map(|(k, v)| (k.as_str(), v.expose()))
    }

    /// Environment variable names, safe to log.
    pub fn env_names(&self) -> Vec<&str> {
        self.env.keys().map(String::as_str).collect()
    }

    /// Header names, safe to log.
    pub fn header_names(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.env.is_empty()
    }

    /// Merge the header credentials into an outbound request's header map.
    ///
    /// Entries that are not valid header names or values are skipped with a
    /// warning naming the header (never the value).
    pub fn apply_headers(&self, headers: &mut reqwest::header::HeaderMap) {
        for (name, value) in &self.headers {
            match (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value.expose()),
            ) {
                (Ok(name), Ok(mut value)) => {
                    value.set_sensitive(true);
                    headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(
                        backend = %self.backend,
                        header = %name,
                        "skipping credential header with invalid name or value"
                    );
                }
            }
        }
    }
}

/// Looks up a variable referenced by a template.
pub type VariableLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves per-backend credential templates.
pub struct SecretBroker {
    template: Regex,
    lookup: VariableLookup,
}

impl std::fmt::Debug for SecretBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBroker").finish_non_exhaustive()
    }
}

impl SecretBroker {
    /// Create a broker that resolves templates from the process environment.
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::with_lookup(Arc::new(|name: &str| std::env::var(name).ok()))
    }

    /// Create a broker with a custom variable lookup.
    pub fn with_lookup(lookup: VariableLookup) -> Result<Self, GatewayError> {
        let template = Regex::new(TEMPLATE_PATTERN)
            .map_err(|e| GatewayError::Internal(format!("invalid template pattern: {e}")))?;
        Ok(Self { template, lookup })
    }

    /// Expand every `${NAME}` in `input`.
    ///
    /// Returns the name of the first variable that could not be resolved.
    pub fn expand(&self, input: &str) -> Result<String, String> {
        let mut output = String::with_capacity(input.len());
        let mut last = 0;
        for captures in self.template.captures_iter(input) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let value = (self.lookup)(name.as_str()).ok_or_else(|| name.as_str().to_string())?;
            output.push_str(&input[last..whole.start()]);
            output.push_str(&value);
            last = whole.end();
        }
        output.push_str(&input[last..]);
        Ok(output)
    }

    /// Resolve the credential set for one backend.
    ///
    /// A template referencing an unset variable is a configuration error
    /// naming the backend, the field and the variable.
    pub fn resolve(&self, backend: &str, spec: &BackendSpec) -> Result<CredentialSet, GatewayError> {
        let headers = self.resolve_map(backend, "headers", &spec.headers)?;
        let env = self.resolve_map(backend, "env", &spec.env)?;
        let set = CredentialSet {
            backend: backend.to_string(),
            headers,
            env,
        };
        debug!(
            backend,
            headers = ?set.header_names(),
            env = ?set.env_names(),
            "resolved backend credentials"
        );
        Ok(set)
    }

    fn resolve_map(
        &self,
        backend: &str,
        field: &str,
        templates: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, Credential>, GatewayError> {
        templates
            .iter()
            .map(|(key, template)| {
                let value = self.expand(template).map_err(|missing| {
                    GatewayError::Config(format!(
                        "backend '{backend}': {field}.{key} references unset variable '{missing}'"
                    ))
                })?;
                Ok((key.clone(), Credential::new(value)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn broker(vars: &[(&str, &str)]) -> SecretBroker {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SecretBroker::with_lookup(Arc::new(move |name: &str| vars.get(name).cloned())).unwrap()
    }

    fn http_spec(headers: &[(&str, &str)]) -> BackendSpec {
        BackendSpec {
            url: Some("http://localhost:9000".into()),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_expand_templates() {
        let broker = broker(&[("TOKEN", "abc"), ("ORG", "acme")]);
        assert_eq!(broker.expand("Bearer ${TOKEN}").unwrap(), "Bearer abc");
        assert_eq!(broker.expand("${ORG}/${TOKEN}!").unwrap(), "acme/abc!");
        assert_eq!(broker.expand("no templates").unwrap(), "no templates");
        assert_eq!(broker.expand("$TOKEN stays").unwrap(), "$TOKEN stays");
        assert_eq!(broker.expand("${MISSING}").unwrap_err(), "MISSING");
    }

    #[test]
    fn test_resolve_headers_and_env() {
        let broker = broker(&[("GITHUB_TOKEN", "ghp_secret")]);
        let mut spec = http_spec(&[("Authorization", "Bearer ${GITHUB_TOKEN}")]);
        spec.env.insert("MODE".into(), "fast".into());

        let set = broker.resolve("github", &spec).unwrap();
        assert_eq!(set.backend(), "github");
        let headers: Vec<_> = set.headers().collect();
        assert_eq!(headers, vec![("Authorization", "Bearer ghp_secret")]);
        let env: Vec<_> = set.env().collect();
        assert_eq!(env, vec![("MODE", "fast")]);
    }

    #[test]
    fn test_missing_variable_is_config_error() {
        let broker = broker(&[]);
        let spec = http_spec(&[("Authorization", "Bearer ${GITHUB_TOKEN}")]);
        let err = broker.resolve("github", &spec).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
        let msg = err.to_string();
        assert!(msg.contains("github") && msg.contains("GITHUB_TOKEN"), "{msg}");
    }

    #[test]
    fn test_credentials_never_print_plaintext() {
        let credential = Credential::new("Bearer ghp_secret");
        assert!(!format!("{credential:?}").contains("ghp_secret"));
        assert_eq!(credential.to_string(), "Bearer [REDACTED]");
        assert_eq!(redact("opaque-token"), "[REDACTED]");

        let broker = broker(&[("T", "ghp_secret")]);
        let set = broker
            .resolve("github", &http_spec(&[("Authorization", "Bearer ${T}")]))
            .unwrap();
        assert!(!format!("{set:?}").contains("ghp_secret"));
    }

    #[test]
    fn test_sets_are_isolated_per_backend() {
        let broker = broker(&[("A_TOKEN", "token-a"), ("B_TOKEN", "token-b")]);
        let a = broker
            .resolve("a", &http_spec(&[("Authorization", "Bearer ${A_TOKEN}")]))
            .unwrap();
        let b = broker
            .resolve("b", &http_spec(&[("X-Api-Key", "${B_TOKEN}")]))
            .unwrap();

        let mut headers = reqwest::header::HeaderMap::new();
        a.apply_headers(&mut headers);
        assert_eq!(headers["authorization"], "Bearer token-a");
        assert!(headers.get("x-api-key").is_none());

        let mut headers = reqwest::header::HeaderMap::new();
        b.apply_headers(&mut headers);
        assert_eq!(headers["x-api-key"], "token-b");
        assert!(headers.get("authorization").is_none());
    }

    #[test]
    fn test_invalid_header_value_skipped() {
        let broker = broker(&[("T", "line\nbreak")]);
        let set = broker
            .resolve("x", &http_spec(&[("Authorization", "${T}")]))
            .unwrap();
        let mut headers = reqwest::header::HeaderMap::new();
        set.apply_headers(&mut headers);
        assert!(headers.is_empty());
    }
}
