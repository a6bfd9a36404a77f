//! Prompt registry with versioned, content-hashed templates.
//!
//! Steps reference prompts either as `id#version` registry lookups or as
//! inline text via the `inline: ` prefix. Every resolution returns the
//! provenance record that ends up in the run record.

use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::ids;
use crate::types::PromptUsed;

/// A registered prompt template at a specific version.
#[derive(Debug, Clone)]
pub struct PromptVersion {
    /// Registry id.
    pub id: String,
    /// Version label (e.g. `v1`).
    pub version: String,
    /// The template text.
    pub template: String,
    /// Hash of the template content.
    pub content_hash: String,
}

/// Explicit registry of prompt templates, populated at process start.
#[derive(Debug, Default)]
pub struct PromptRegistry {
    entries: HashMap<String, PromptVersion>,
}

impl PromptRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template under `id#version`, computing its content hash.
    /// Re-registering the same key overwrites.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        version: impl Into<String>,
        template: impl Into<String>,
    ) -> PromptUsed {
        let id = id.into();
        let version = version.into();
        let template = template.into();
        let content_hash = ids::hash_bytes(template.as_bytes(), "prompt");
        let entry = PromptVersion {
            id: id.clone(),
            version: version.clone(),
            template,
            content_hash: content_hash.clone(),
        };
        self.entries.insert(format!("{id}#{version}"), entry);
        PromptUsed {
            id,
            version,
            content_hash,
        }
    }

    /// Look up `id#version`. A bare `id` resolves when exactly one version
    /// of that id is registered.
    pub fn get(&self, reference: &str) -> Result<&PromptVersion> {
        if let Some(entry) = self.entries.get(reference) {
            return Ok(entry);
        }
        if !reference.contains('#') {
            let mut matches = self.entries.values().filter(|p| p.id == reference);
            if let (Some(only), None) = (matches.next(), matches.next()) {
                return Ok(only);
            }
        }
        Err(EngineError::Config(format!(
            "unknown prompt reference: {reference:?}"
        )))
    }

    /// Resolve a step's prompt field into `(template, provenance)`.
    ///
    /// `inline: ...` means the remainder IS the template (id `inline`,
    /// version `v0`); anything else is a registry reference.
    pub fn resolve(&self, step_prompt: &str) -> Result<(String, PromptUsed)> {
        if let Some(inline) = step_prompt.strip_prefix("inline:") {
            let template = inline.trim_start().to_string();
            let content_hash = ids::hash_bytes(template.as_bytes(), "prompt");
            return Ok((
                template,
                PromptUsed {
                    id: "inline".to_string(),
                    version: "v0".to_string(),
                    content_hash,
                },
            ));
        }
        let entry = self.get(step_prompt)?;
        Ok((
            entry.template.clone(),
            PromptUsed {
                id: entry.id.clone(),
                version: entry.version.clone(),
                content_hash: entry.content_hash.clone(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let mut registry = PromptRegistry::new();
        registry.register("summarise", "v1", "Summarise: ${chunk.text}");
        let entry = registry.get("summarise#v1").unwrap();
        assert_eq!(entry.template, "Summarise: ${chunk.text}");
        assert!(!entry.content_hash.is_empty());
    }

    #[test]
    fn test_bare_id_resolves_single_version() {
        let mut registry = PromptRegistry::new();
        registry.register("summarise", "v1", "one");
        assert_eq!(registry.get("summarise").unwrap().version, "v1");

        registry.register("summarise", "v2", "two");
        assert!(registry.get("summarise").is_err());
    }

    #[test]
    fn test_unknown_reference_is_config_error() {
        let registry = PromptRegistry::new();
        let err = registry.get("nope#v1").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_inline_prefix() {
        let registry = PromptRegistry::new();
        let (template, used) = registry.resolve("inline: Echo: ${row.text}").unwrap();
        assert_eq!(template, "Echo: ${row.text}");
        assert_eq!(used.id, "inline");
        assert_eq!(used.version, "v0");
    }

    #[test]
    fn test_same_content_same_hash() {
        let mut registry = PromptRegistry::new();
        let a = registry.register("a", "v1", "same text");
        let b = registry.register("b", "v1", "same text");
        assert_eq!(a.content_hash, b.content_hash);
    }
}
