use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Debounce delay bounds, in milliseconds.
const MIN_DIAGNOSTIC_DELAY_MS: u64 = 50;
const MAX_DIAGNOSTIC_DELAY_MS: u64 = 2000;

/// Settings recognized under the `pike` section of the editor configuration.
///
/// Arrives via `initializationOptions.pike` or
/// `workspace/didChangeConfiguration`; unknown fields are ignored so editors
/// can carry their own keys alongside ours.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[schemars(rename = "pike-lsp settings")]
pub struct Settings {
    /// Path to the Pike interpreter executable.
    #[serde(default = "default_pike_path")]
    pub pike_path: String,

    /// Colon-separated include search path, prepended to `PIKE_INCLUDE_PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pike_include_path: Option<String>,

    /// Colon-separated module search path, prepended to `PIKE_MODULE_PATH`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pike_module_path: Option<String>,

    /// Debounce delay before re-analysis, in milliseconds. Clamped to
    /// [50, 2000].
    #[serde(default = "default_diagnostic_delay")]
    pub diagnostic_delay: u64,

    /// Cap on diagnostics published per document.
    #[serde(default = "default_max_problems")]
    pub max_number_of_problems: usize,
}

fn default_pike_path() -> String {
    "pike".to_string()
}

fn default_diagnostic_delay() -> u64 {
    250
}

fn default_max_problems() -> usize {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pike_path: default_pike_path(),
            pike_include_path: None,
            pike_module_path: None,
            diagnostic_delay: default_diagnostic_delay(),
            max_number_of_problems: default_max_problems(),
        }
    }
}

impl Settings {
    /// Extract settings from LSP `initializationOptions` (or the `settings`
    /// value of `didChangeConfiguration`). Accepts either the bare section
    /// or an object with a `pike` key; anything unparseable falls back to
    /// defaults field by field via serde defaults.
    pub fn from_lsp_value(value: Option<&serde_json::Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        let section = value.get("pike").unwrap_or(value);
        serde_json::from_value(section.clone()).unwrap_or_default()
    }

    /// The debounce delay, clamped to the supported range.
    pub fn diagnostic_delay(&self) -> Duration {
        Duration::from_millis(
            self.diagnostic_delay
                .clamp(MIN_DIAGNOSTIC_DELAY_MS, MAX_DIAGNOSTIC_DELAY_MS),
        )
    }

    /// Include directories: the configured path first, then the launch
    /// environment's `PIKE_INCLUDE_PATH`.
    pub fn include_dirs(&self) -> Vec<PathBuf> {
        split_search_path(
            self.pike_include_path.as_deref(),
            std::env::var("PIKE_INCLUDE_PATH").ok().as_deref(),
        )
    }

    /// Module directories, same precedence as [`Settings::include_dirs`].
    pub fn module_dirs(&self) -> Vec<PathBuf> {
        split_search_path(
            self.pike_module_path.as_deref(),
            std::env::var("PIKE_MODULE_PATH").ok().as_deref(),
        )
    }

    /// Environment to hand the child: configured paths joined with the
    /// inherited ones, under the names the interpreter reads.
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        let include = join_paths(&self.include_dirs());
        if !include.is_empty() {
            env.push(("PIKE_INCLUDE_PATH", include));
        }
        let modules = join_paths(&self.module_dirs());
        if !modules.is_empty() {
            env.push(("PIKE_MODULE_PATH", modules));
        }
        env
    }
}

fn split_search_path(configured: Option<&str>, inherited: Option<&str>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for source in [configured, inherited].into_iter().flatten() {
        for part in source.split(':').filter(|p| !p.is_empty()) {
            let path = PathBuf::from(part);
            if !dirs.contains(&path) {
                dirs.push(path);
            }
        }
    }
    dirs
}

fn join_paths(dirs: &[PathBuf]) -> String {
    dirs.iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.pike_path, "pike");
        assert_eq!(s.diagnostic_delay().as_millis(), 250);
        assert_eq!(s.max_number_of_problems, 100);
    }

    #[test]
    fn diagnostic_delay_clamps_to_bounds() {
        let mut s = Settings::default();
        s.diagnostic_delay = 10;
        assert_eq!(s.diagnostic_delay().as_millis(), 50);
        s.diagnostic_delay = 60_000;
        assert_eq!(s.diagnostic_delay().as_millis(), 2000);
        s.diagnostic_delay = 500;
        assert_eq!(s.diagnostic_delay().as_millis(), 500);
    }

    #[test]
    fn parses_nested_pike_section() {
        let value = serde_json::json!({
            "pike": {"pikePath": "/opt/pike/bin/pike", "diagnosticDelay": 100}
        });
        let s = Settings::from_lsp_value(Some(&value));
        assert_eq!(s.pike_path, "/opt/pike/bin/pike");
        assert_eq!(s.diagnostic_delay, 100);
        // Untouched fields keep defaults.
        assert_eq!(s.max_number_of_problems, 100);
    }

    #[test]
    fn parses_bare_section_and_ignores_unknown_keys() {
        let value = serde_json::json!({
            "pikePath": "pike9",
            "someEditorKey": true
        });
        let s = Settings::from_lsp_value(Some(&value));
        assert_eq!(s.pike_path, "pike9");
    }

    #[test]
    fn missing_options_fall_back_to_defaults() {
        let s = Settings::from_lsp_value(None);
        assert_eq!(s.pike_path, "pike");
    }

    #[test]
    fn search_path_splits_and_dedups() {
        let dirs = split_search_path(Some("/a:/b"), Some("/b:/c:"));
        assert_eq!(
            dirs,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }
}
