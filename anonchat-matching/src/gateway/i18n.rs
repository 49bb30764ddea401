use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

/// Translation catalogue loaded from `lang.json`: language, then key, then text.
///
/// Values are strings, except option lists such as the report reasons which
/// are arrays of strings.
#[derive(Debug, Clone)]
pub struct Localizer {
    catalogues: HashMap<String, HashMap<String, Value>>,
    default_language: String,
}

impl Localizer {
    pub fn from_file(path: impl AsRef<Path>, default_language: &str) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        Self::from_json(&raw, default_language)
    }

    pub fn from_json(raw: &str, default_language: &str) -> anyhow::Result<Self> {
        let catalogues: HashMap<String, HashMap<String, Value>> = serde_json::from_str(raw)?;
        anyhow::ensure!(
            catalogues.contains_key(default_language),
            "translations have no entry for default language {default_language}"
        );
        tracing::info!(languages = catalogues.len(), default = default_language, "translations loaded");
        Ok(Self {
            catalogues,
            default_language: default_language.to_string(),
        })
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    pub fn supports(&self, language: &str) -> bool {
        self.catalogues.contains_key(language)
    }

    /// The language to record for a client hint: the hint itself when it has
    /// a translation, the default otherwise. Region tags like `pt-BR` fall
    /// back to their primary subtag.
    pub fn resolve(&self, hint: Option<&str>) -> String {
        let Some(hint) = hint.map(str::trim).filter(|h| !h.is_empty()) else {
            return self.default_language.clone();
        };
        let hint = hint.to_ascii_lowercase();
        if self.supports(&hint) {
            return hint;
        }
        match hint.split(['-', '_']).next() {
            Some(primary) if self.supports(primary) => primary.to_string(),
            _ => self.default_language.clone(),
        }
    }

    fn lookup(&self, language: &str, key: &str) -> Option<&Value> {
        self.catalogues
            .get(language)
            .and_then(|c| c.get(key))
            .or_else(|| self.catalogues.get(&self.default_language).and_then(|c| c.get(key)))
    }

    /// Render a message, substituting `{name}` placeholders. Unknown keys
    /// render as the key itself.
    pub fn text(&self, language: &str, key: &str, params: &[(&str, String)]) -> String {
        let mut text = match self.lookup(language, key) {
            Some(Value::String(s)) => s.clone(),
            _ => key.to_string(),
        };
        for (name, value) in params {
            text = text.replace(&format!("{{{name}}}"), value);
        }
        text
    }

    pub fn options(&self, language: &str, key: &str) -> Vec<String> {
        match self.lookup(language, key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}
