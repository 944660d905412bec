//! Stub Pike interpreter speaking the pike-lsp child protocol.
//!
//! Lets the server run end-to-end (tests, demos) without a Pike
//! installation. The "analysis" is a deliberately naive line scanner; good
//! enough to exercise the protocol, nothing more.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Instant;

use serde_json::{Value, json};

struct Counters {
    analyze: u64,
    hits: u64,
    misses: u64,
}

fn main() {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut counters = Counters {
        analyze: 0,
        misses: 0,
        hits: 0,
    };

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("stub: discarding unparseable request: {e}");
                continue;
            }
        };

        let Some(id) = request.get("id").and_then(Value::as_u64) else {
            continue; // notification; nothing to answer
        };
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let started = Instant::now();
        let response = match handle(&method, &params, &mut counters) {
            Ok(mut result) => {
                if let Some(obj) = result.as_object_mut() {
                    obj.insert(
                        "_perf".into(),
                        json!({"pike_total_ms": started.elapsed().as_secs_f64() * 1000.0}),
                    );
                }
                json!({"jsonrpc": "2.0", "id": id, "result": result})
            }
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };

        let mut bytes = serde_json::to_vec(&response).expect("response serializes");
        bytes.push(b'\n');
        if stdout.write_all(&bytes).is_err() || stdout.flush().is_err() {
            break;
        }
    }
}

type MethodResult = Result<Value, (i64, String)>;

fn handle(method: &str, params: &Value, counters: &mut Counters) -> MethodResult {
    match method {
        "get_version" => {
            // Test hook: act like an interpreter that is alive but cannot
            // report its version.
            if std::env::var_os("PIKE_LSP_STUB_FAIL_VERSION").is_some() {
                return Err((-32000, "version unavailable".to_string()));
            }
            Ok(json!({
                "version": "9.0",
                "display": "Pike v9.0 (pike-lsp stub)",
                "absolute_path": std::env::current_exe()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            }))
        }
        "analyze" => analyze(params, counters),
        "batch_parse" => batch_parse(params),
        "resolve_stdlib" => resolve_stdlib(params),
        "resolve_include" => resolve_include(params),
        "get_completion_context" => completion_context(params),
        "find_occurrences" => {
            let text = str_param(params, "text")?;
            Ok(json!({"occurrences": occurrences(text)}))
        }
        "get_inherited" => get_inherited(params),
        "extract_imports" => {
            let code = str_param(params, "code")?;
            Ok(json!({"imports": extract_imports(code)}))
        }
        "resolve_import" => Ok(json!({"path": null})),
        "check_circular" => check_circular(params),
        "get_waterfall_symbols" => {
            let code = str_param(params, "code")?;
            let symbols: Vec<Value> = scan_symbols(code)
                .into_iter()
                .map(|mut s| {
                    s.as_object_mut()
                        .expect("symbol object")
                        .insert("depth".into(), json!(0));
                    s
                })
                .collect();
            Ok(json!({"symbols": symbols}))
        }
        "get_cache_stats" => Ok(json!({
            "size": 0,
            "hits": counters.hits,
            "misses": counters.misses,
            "evictions": 0,
            "analyze_count": counters.analyze,
        })),
        "invalidate_cache" => {
            counters.hits = 0;
            counters.misses = 0;
            Ok(json!({"ok": true}))
        }
        // Deprecated single-purpose methods, kept for compatibility.
        "parse" => {
            eprintln!("stub: 'parse' is deprecated, use 'analyze'");
            let code = str_param(params, "code")?;
            Ok(json!({"symbols": scan_symbols(code), "diagnostics": scan_diagnostics(code)}))
        }
        "introspect" => {
            eprintln!("stub: 'introspect' is deprecated, use 'analyze'");
            let code = str_param(params, "code")?;
            introspect(code, str_param(params, "filename").unwrap_or_default())
        }
        "analyze_uninitialized" => {
            eprintln!("stub: 'analyze_uninitialized' is deprecated, use 'analyze'");
            let code = str_param(params, "code")?;
            Ok(json!({"diagnostics": scan_diagnostics(code)}))
        }
        "tokenize" => {
            eprintln!("stub: 'tokenize' is deprecated, use 'analyze'");
            let code = str_param(params, "code")?;
            Ok(json!({"tokens": tokens(code)}))
        }
        "compile" => {
            eprintln!("stub: 'compile' is deprecated, use 'analyze'");
            let code = str_param(params, "code")?;
            let diagnostics = scan_diagnostics(code);
            Ok(json!({"ok": diagnostics.is_empty(), "diagnostics": diagnostics}))
        }
        // Test hook: die with the given exit code, mid-conversation.
        "debug_exit" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(7);
            eprintln!("stub: error: exiting on request with code {code}");
            std::process::exit(code as i32);
        }
        other => {
            eprintln!("stub: error: unknown method '{other}'");
            Err((-32601, format!("Method not found: {other}")))
        }
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, (i64, String)> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| (-32602, format!("missing parameter '{key}'")))
}

fn analyze(params: &Value, counters: &mut Counters) -> MethodResult {
    counters.analyze += 1;
    counters.misses += 1;
    let code = str_param(params, "code")?;
    let filename = str_param(params, "filename").unwrap_or("input.pike");
    let include: Vec<String> = params
        .get("include")
        .and_then(Value::as_array)
        .map(|kinds| {
            kinds
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    let diagnostics = scan_diagnostics(code);
    let compiles = diagnostics.is_empty();

    let mut result = serde_json::Map::new();
    let mut failures = serde_json::Map::new();

    for kind in &include {
        match kind.as_str() {
            "parse" => {
                result.insert(
                    "parse".into(),
                    json!({"symbols": scan_symbols(code), "diagnostics": diagnostics.clone()}),
                );
            }
            "diagnostics" => {
                result.insert("diagnostics".into(), json!(diagnostics.clone()));
            }
            "tokenize" => {
                result.insert("tokenize".into(), json!(tokens(code)));
            }
            "introspect" => {
                if compiles {
                    result.insert("introspect".into(), introspect(code, filename)?);
                } else {
                    failures.insert(
                        "introspect".into(),
                        json!({"message": "compilation failed", "kind": "CompilationError"}),
                    );
                }
            }
            other => {
                failures.insert(
                    other.to_string(),
                    json!({"message": format!("unknown analysis kind '{other}'"), "kind": "BadRequest"}),
                );
            }
        }
    }

    Ok(json!({"result": result, "failures": failures}))
}

fn batch_parse(params: &Value) -> MethodResult {
    let files = params
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| (-32602, "missing parameter 'files'".to_string()))?;
    let results: Vec<Value> = files
        .iter()
        .map(|file| {
            let filename = file.get("filename").and_then(Value::as_str).unwrap_or("");
            let code = file.get("code").and_then(Value::as_str).unwrap_or("");
            json!({
                "filename": filename,
                "symbols": scan_symbols(code),
                "diagnostics": scan_diagnostics(code),
            })
        })
        .collect();
    Ok(json!({"files": results}))
}

fn introspect(code: &str, filename: &str) -> MethodResult {
    let imports = extract_imports(code);
    let inherits: Vec<&str> = imports
        .iter()
        .filter(|i| i["kind"] == "inherit")
        .filter_map(|i| i["name"].as_str())
        .collect();
    let includes: Vec<&str> = imports
        .iter()
        .filter(|i| i["kind"] == "include")
        .filter_map(|i| i["name"].as_str())
        .collect();
    let imported: Vec<&str> = imports
        .iter()
        .filter(|i| i["kind"] == "import")
        .filter_map(|i| i["name"].as_str())
        .collect();

    // Dependencies: inherit targets that exist next to the analyzed file.
    let base = Path::new(filename).parent().unwrap_or(Path::new("."));
    let mut dependencies: Vec<String> = Vec::new();
    for target in inherits.iter().chain(includes.iter()) {
        let candidate = base.join(target.trim_matches('"'));
        if candidate.is_file() {
            let resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate);
            dependencies.push(resolved.display().to_string());
        }
    }

    Ok(json!({
        "symbols": scan_symbols(code),
        "inherits": inherits,
        "dependencies": dependencies,
        "includes": includes,
        "imports": imported,
        "program_handle": format!("prog:{filename}"),
    }))
}

fn resolve_stdlib(params: &Value) -> MethodResult {
    let module = str_param(params, "module")?;
    let table = stdlib_table();
    match table.get(module) {
        Some(entry) => Ok(entry.clone()),
        None => Ok(Value::Null),
    }
}

fn stdlib_table() -> HashMap<&'static str, Value> {
    let lib = "/usr/local/pike/lib/modules";
    let mut table = HashMap::new();
    table.insert(
        "Stdio",
        json!({
            "symbols": [
                {"name": "File", "kind": "class", "position": {"line": 40, "column": 1}},
                {"name": "Stdin", "kind": "variable", "position": {"line": 900, "column": 1}},
                {"name": "read_file", "kind": "method", "position": {"line": 1200, "column": 1},
                 "type": "string", "argNames": ["filename"]},
            ],
            "file_path": format!("{lib}/Stdio.pmod/module.pmod:1"),
            "inherits": [],
        }),
    );
    table.insert(
        "Stdio.File",
        json!({
            "symbols": [
                {"name": "open", "kind": "method", "position": {"line": 44, "column": 3},
                 "type": "int", "argNames": ["filename", "mode"], "classname": "Stdio.File"},
                {"name": "read", "kind": "method", "position": {"line": 80, "column": 3},
                 "type": "string", "argNames": ["nbytes"], "classname": "Stdio.File"},
                {"name": "write", "kind": "method", "position": {"line": 120, "column": 3},
                 "type": "int", "argNames": ["data"], "classname": "Stdio.File"},
                {"name": "close", "kind": "method", "position": {"line": 160, "column": 3},
                 "type": "int", "argNames": [], "classname": "Stdio.File"},
            ],
            "file_path": format!("{lib}/Stdio.pmod/module.pmod:42"),
            "inherits": ["Stdio.Fd"],
        }),
    );
    table.insert(
        "String",
        json!({
            "symbols": [
                {"name": "trim", "kind": "method", "position": {"line": 10, "column": 1},
                 "type": "string", "argNames": ["s"]},
                {"name": "Buffer", "kind": "class", "position": {"line": 60, "column": 1}},
            ],
            "file_path": format!("{lib}/String.pmod:1"),
            "inherits": [],
        }),
    );
    table
}

fn resolve_include(params: &Value) -> MethodResult {
    let spec = str_param(params, "include")?;
    let current = str_param(params, "current_file").unwrap_or("");
    let base = Path::new(current).parent().unwrap_or(Path::new("."));
    let candidate = base.join(spec);
    if candidate.is_file() {
        let resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate);
        Ok(json!({"path": resolved.display().to_string()}))
    } else {
        Ok(json!({"path": null}))
    }
}

fn completion_context(params: &Value) -> MethodResult {
    let code = str_param(params, "code")?;
    let position = params
        .get("position")
        .ok_or_else(|| (-32602, "missing parameter 'position'".to_string()))?;
    let line = position.get("line").and_then(Value::as_u64).unwrap_or(1) as usize;
    let column = position.get("column").and_then(Value::as_u64).unwrap_or(1) as usize;

    let Some(text) = code.lines().nth(line.saturating_sub(1)) else {
        return Err((-32602, "position out of range".to_string()));
    };
    let upto = &text[..column.saturating_sub(1).min(text.len())];

    // Look backwards for `base.` / `base->` before the cursor.
    let (operator, op_len, op_at) = ["->", ".", "::"]
        .iter()
        .filter_map(|op| upto.rfind(op).map(|at| (*op, op.len(), at)))
        .max_by_key(|(_, _, at)| *at)
        .map(|(op, len, at)| (Some(op), len, Some(at)))
        .unwrap_or((None, 0, None));

    let (base, member) = match op_at {
        Some(at) => {
            let before = &upto[..at];
            let base_start = before
                .rfind(|c: char| !(c == '_' || c == '.' || c.is_ascii_alphanumeric()))
                .map(|i| i + 1)
                .unwrap_or(0);
            let member = &upto[at + op_len..];
            (
                Some(before[base_start..].to_string()),
                (!member.is_empty()).then(|| member.to_string()),
            )
        }
        None => (None, None),
    };

    let is_module_path = base
        .as_deref()
        .and_then(|b| b.chars().next())
        .is_some_and(|c| c.is_ascii_uppercase());

    Ok(json!({
        "base": base,
        "member": member,
        "operator": operator,
        "is_module_path": is_module_path,
    }))
}

fn get_inherited(params: &Value) -> MethodResult {
    let class = str_param(params, "class")?;
    let table = stdlib_table();
    match table.get(class) {
        Some(entry) => Ok(json!({"symbols": entry.get("symbols").cloned().unwrap_or_default()})),
        None => Err((-32001, format!("class not found: {class}"))),
    }
}

fn check_circular(params: &Value) -> MethodResult {
    let code = str_param(params, "code")?;
    let filename = str_param(params, "filename").unwrap_or("");
    let stem = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let circular = !stem.is_empty()
        && extract_imports(code)
            .iter()
            .filter(|i| i["kind"] == "inherit")
            .filter_map(|i| i["name"].as_str())
            .any(|name| name.trim_matches('"') == stem);
    Ok(json!({"circular": circular}))
}

// --- the naive line scanner ---

const TYPE_WORDS: &[&str] = &[
    "array", "float", "function", "int", "mapping", "mixed", "multiset", "object", "program",
    "string", "void",
];

const STMT_WORDS: &[&str] = &[
    "break", "case", "catch", "continue", "do", "else", "for", "foreach", "gauge", "if",
    "lambda", "return", "sscanf", "switch", "while",
];

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn symbol(name: &str, kind: &str, line: usize, column: usize) -> Value {
    json!({
        "name": name,
        "kind": kind,
        "position": {"line": line, "column": column},
        "children": [],
        "modifiers": [],
        "argNames": [],
    })
}

/// Scan for declarations. A `class` line opens a container; declarations at
/// deeper brace depth become its children.
fn scan_symbols(code: &str) -> Vec<Value> {
    let mut top: Vec<Value> = Vec::new();
    let mut class_stack: Vec<(Value, i32)> = Vec::new();
    let mut depth: i32 = 0;

    for (idx, raw) in code.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end();
        let trimmed = line.trim_start();
        let indent = line.len() - trimmed.len();

        let mut push = |value: Value, class_stack: &mut Vec<(Value, i32)>, top: &mut Vec<Value>| {
            match class_stack.last_mut() {
                Some((class, _)) => class["children"]
                    .as_array_mut()
                    .expect("children array")
                    .push(value),
                None => top.push(value),
            }
        };

        if let Some(rest) = trimmed.strip_prefix("class ") {
            let name: String = rest
                .chars()
                .take_while(|c| *c == '_' || c.is_ascii_alphanumeric())
                .collect();
            if is_ident(&name) {
                let class = symbol(&name, "class", line_no, indent + 7);
                class_stack.push((class, depth));
            }
        } else if let Some(rest) = trimmed.strip_prefix("inherit ") {
            let target = rest.trim_end_matches(';').trim().to_string();
            push(
                symbol(&target, "inherit", line_no, indent + 9),
                &mut class_stack,
                &mut top,
            );
        } else if let Some(rest) = trimmed.strip_prefix("import ") {
            let target = rest.trim_end_matches(';').trim();
            push(
                symbol(target, "import", line_no, indent + 8),
                &mut class_stack,
                &mut top,
            );
        } else if let Some(rest) = trimmed.strip_prefix("constant ") {
            let name: String = rest
                .chars()
                .take_while(|c| *c == '_' || c.is_ascii_alphanumeric())
                .collect();
            if is_ident(&name) {
                push(
                    symbol(&name, "constant", line_no, indent + 10),
                    &mut class_stack,
                    &mut top,
                );
            }
        } else if trimmed.starts_with("#include") {
            if let Some(open) = trimmed.find('"')
                && let Some(close) = trimmed[open + 1..].find('"')
            {
                let spec = &trimmed[open + 1..open + 1 + close];
                push(
                    symbol(spec, "include", line_no, indent + open + 2),
                    &mut class_stack,
                    &mut top,
                );
            }
        } else if let Some(value) = scan_declaration(trimmed, line_no, indent) {
            push(value, &mut class_stack, &mut top);
        }

        for b in line.bytes() {
            match b {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if let Some((_, open_depth)) = class_stack.last()
                        && depth <= *open_depth
                    {
                        let (class, _) = class_stack.pop().expect("class on stack");
                        match class_stack.last_mut() {
                            Some((parent, _)) => parent["children"]
                                .as_array_mut()
                                .expect("children array")
                                .push(class),
                            None => top.push(class),
                        }
                    }
                }
                _ => {}
            }
        }
    }

    // Unclosed classes still count.
    while let Some((class, _)) = class_stack.pop() {
        top.push(class);
    }
    top
}

/// `type name(args)` → method, `type name;` / `type name = …;` → variable.
fn scan_declaration(trimmed: &str, line_no: usize, indent: usize) -> Option<Value> {
    let words: Vec<&str> = trimmed
        .split(|c: char| c.is_whitespace())
        .filter(|w| !w.is_empty())
        .collect();
    let mut cursor = 0;
    let mut modifiers: Vec<&str> = Vec::new();
    while cursor < words.len()
        && matches!(
            words[cursor],
            "static" | "protected" | "private" | "public" | "final" | "inline"
        )
    {
        modifiers.push(words[cursor]);
        cursor += 1;
    }
    let type_word = *words.get(cursor)?;
    if !TYPE_WORDS.contains(&type_word) {
        return None;
    }

    let rest = trimmed
        .splitn(cursor + 2, char::is_whitespace)
        .last()?
        .trim_start();
    let name: String = rest
        .chars()
        .take_while(|c| *c == '_' || c.is_ascii_alphanumeric())
        .collect();
    if !is_ident(&name) || STMT_WORDS.contains(&name.as_str()) {
        return None;
    }
    let after = &rest[name.len()..];
    let column = indent + trimmed.len() - rest.len() + 1;

    if let Some(args) = after.strip_prefix('(') {
        let arg_names: Vec<String> = args
            .split(')')
            .next()
            .unwrap_or("")
            .split(',')
            .filter_map(|part| {
                part.trim()
                    .rsplit(|c: char| c.is_whitespace() || c == '*')
                    .next()
                    .filter(|w| is_ident(w))
                    .map(str::to_owned)
            })
            .collect();
        let mut value = symbol(&name, "method", line_no, column);
        value["type"] = json!(type_word);
        value["modifiers"] = json!(modifiers);
        value["argNames"] = json!(arg_names);
        Some(value)
    } else if after.trim_start().starts_with(';') || after.trim_start().starts_with('=') {
        let mut value = symbol(&name, "variable", line_no, column);
        value["type"] = json!(type_word);
        value["modifiers"] = json!(modifiers);
        Some(value)
    } else {
        None
    }
}

/// Brace balance is the one compile check the stub performs.
fn scan_diagnostics(code: &str) -> Vec<Value> {
    let mut diagnostics = Vec::new();
    let mut depth: i64 = 0;
    let mut last_open = (1usize, 1usize);

    for (idx, line) in code.lines().enumerate() {
        for (col, b) in line.bytes().enumerate() {
            match b {
                b'{' => {
                    depth += 1;
                    last_open = (idx + 1, col + 1);
                }
                b'}' => {
                    depth -= 1;
                    if depth < 0 {
                        diagnostics.push(json!({
                            "line": idx + 1,
                            "column": col + 1,
                            "message": "unexpected '}'",
                            "severity": "error",
                        }));
                        depth = 0;
                    }
                }
                _ => {}
            }
        }
    }
    if depth > 0 {
        diagnostics.push(json!({
            "line": last_open.0,
            "column": last_open.1,
            "message": "missing '}' for this block",
            "severity": "error",
        }));
    }
    diagnostics
}

fn occurrences(text: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'_' || bytes[i].is_ascii_alphabetic() {
                let start = i;
                while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                out.push(json!({
                    "name": &line[start..i],
                    "line": idx + 1,
                    "column": start + 1,
                }));
            } else {
                i += 1;
            }
        }
    }
    out
}

fn tokens(code: &str) -> Vec<Value> {
    occurrences(code)
        .into_iter()
        .map(|o| {
            json!({
                "text": o["name"],
                "line": o["line"],
                "column": o["column"],
            })
        })
        .collect()
}

fn extract_imports(code: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for (idx, line) in code.lines().enumerate() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("import ") {
            out.push(json!({
                "name": rest.trim_end_matches(';').trim(),
                "kind": "import",
                "line": idx + 1,
            }));
        } else if let Some(rest) = trimmed.strip_prefix("inherit ") {
            out.push(json!({
                "name": rest.trim_end_matches(';').trim(),
                "kind": "inherit",
                "line": idx + 1,
            }));
        } else if trimmed.starts_with("#include")
            && let Some(open) = trimmed.find('"')
            && let Some(close) = trimmed[open + 1..].find('"')
        {
            out.push(json!({
                "name": &trimmed[open + 1..open + 1 + close],
                "kind": "include",
                "line": idx + 1,
            }));
        }
    }
    out
}
