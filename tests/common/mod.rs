#![allow(dead_code)]

pub mod lsp_client;

use std::process::Command;

/// Path to the stub interpreter binary built alongside the server.
pub fn stub_path() -> String {
    env!("CARGO_BIN_EXE_pike-lsp-stub").to_string()
}

/// The pike-lsp CLI binary.
pub fn pike_lsp() -> Command {
    Command::new(env!("CARGO_BIN_EXE_pike-lsp"))
}

pub fn fixture(name: &str) -> String {
    format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))
}

/// Run `pike-lsp check … --format json` against the stub and parse stdout.
pub fn check_json(args: &[&str]) -> (serde_json::Value, i32) {
    let output = pike_lsp()
        .arg("check")
        .args(["--pike-path", &stub_path(), "--format", "json"])
        .args(args)
        .output()
        .expect("failed to run pike-lsp");
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap_or_else(|e| {
        panic!(
            "invalid JSON: {e}\nstdout: {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    });
    (json, code)
}

/// Apply insta settings that redact absolute fixture paths and durations.
pub fn with_snapshot_settings(f: impl FnOnce()) {
    let mut settings = insta::Settings::clone_current();
    let fixtures_dir = format!("{}/tests/fixtures/", env!("CARGO_MANIFEST_DIR"));
    settings.add_filter(&regex_escape(&fixtures_dir), "[fixtures]/");
    settings.add_filter(r#""duration_ms": \d+"#, r#""duration_ms": "[duration]""#);
    settings.bind(f);
}

fn regex_escape(s: &str) -> String {
    let mut result = String::with_capacity(s.len() * 2);
    for c in s.chars() {
        match c {
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' => {
                result.push('\\');
                result.push(c);
            }
            _ => result.push(c),
        }
    }
    result
}
