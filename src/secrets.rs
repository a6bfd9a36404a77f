//! Secret resolution and redaction.
//!
//! Secrets are resolved eagerly at startup, cached in process memory by
//! logical name, and injected into provider adapters only. They never enter
//! the template scope, and the [`Redactor`] scrubs registered values from
//! any outbound string (error messages, log lines, artefact-bound records).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{EngineError, Result};

/// Resolves logical credential names to values.
pub trait SecretProvider: Send + Sync {
    /// Resolve a logical name, failing with a secret error when missing.
    fn resolve(&self, name: &str) -> Result<String>;
}

/// Secrets from process environment variables, names passed through as-is.
#[derive(Debug, Default)]
pub struct EnvSecrets;

impl SecretProvider for EnvSecrets {
    fn resolve(&self, name: &str) -> Result<String> {
        std::env::var(name).map_err(|_| EngineError::Secret(format!("missing secret: {name}")))
    }
}

/// Caching wrapper: each logical name is resolved at most once per run.
pub struct SecretCache {
    provider: Box<dyn SecretProvider>,
    cache: Mutex<HashMap<String, String>>,
}

impl SecretCache {
    /// Wrap a provider with a per-run cache.
    pub fn new(provider: Box<dyn SecretProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve through the cache.
    pub fn resolve(&self, name: &str) -> Result<String> {
        if let Some(hit) = self.cache.lock().expect("secret cache poisoned").get(name) {
            return Ok(hit.clone());
        }
        let value = self.provider.resolve(name)?;
        self.cache
            .lock()
            .expect("secret cache poisoned")
            .insert(name.to_string(), value.clone());
        Ok(value)
    }
}

/// Substring redaction of registered secret values.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    values: Vec<String>,
}

impl Redactor {
    /// A redactor with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret value for scrubbing. Empty values are ignored.
    pub fn register(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.values.push(value);
        }
    }

    /// Replace every registered value in `text` with `****`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            out = out.replace(value, "****");
        }
        out
    }
}
