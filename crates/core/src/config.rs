use serde::{Deserialize, Serialize};

pub const DEFAULT_INDICATOR_SELECTOR: &str = "[data-app-loader]";

/// Environment variable holding the process-wide API base locator.
pub const BASE_URL_ENV: &str = "APP_BASEURL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Prefix for relative request locators; also marks fetches the request cache already tracks.
    pub base_url: String,
    /// Selector of the busy indicator element.
    pub indicator_selector: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            indicator_selector: DEFAULT_INDICATOR_SELECTOR.to_string(),
        }
    }
}

impl LoaderConfig {
    /// Defaults, with the base locator taken from `APP_BASEURL` when set.
    pub fn from_env() -> Self {
        let base_url = std::env::var(BASE_URL_ENV).unwrap_or_default();
        Self::default().with_base_url(base_url)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_indicator_selector(mut self, selector: impl Into<String>) -> Self {
        self.indicator_selector = selector.into();
        self
    }

    pub fn has_base_url(&self) -> bool {
        !self.base_url.is_empty()
    }

    pub fn resolve(&self, locator: &str) -> String {
        crate::resolve_locator(&self.base_url, locator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg = LoaderConfig::from_json(r#"{ "base_url": "https://api.example.com" }"#).unwrap();
        assert_eq!(cfg.base_url, "https://api.example.com");
        assert_eq!(cfg.indicator_selector, DEFAULT_INDICATOR_SELECTOR);
        assert_eq!(
            cfg.resolve("/data/a.json"),
            "https://api.example.com/data/a.json"
        );
    }

    #[test]
    fn empty_base_leaves_locators_relative() {
        let cfg = LoaderConfig::default().with_indicator_selector("#spinner");
        assert!(!cfg.has_base_url());
        assert_eq!(cfg.resolve("/a"), "/a");
        assert_eq!(cfg.indicator_selector, "#spinner");
    }
}
