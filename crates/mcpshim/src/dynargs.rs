//! Dynamic argument handling for `call` and alias dispatch.
//!
//! Tool arguments arrive as free-form `--key value` flags and are coerced
//! to the narrowest JSON type that parses (bool, integer, float, string).

use serde_json::{Map, Value};

/// Flags `call` reserves for itself, parsed ahead of the dynamic args.
#[derive(Debug, Default, PartialEq)]
pub struct CallArgs {
    pub server: String,
    pub tool: String,
    pub rest: Vec<String>,
    pub help: bool,
    pub parse_text_json: bool,
}

/// Split `call`'s own flags from the tool's arguments. `--` passes the
/// remainder through verbatim so tools can take reserved names like
/// `--server` or `--help`.
pub fn parse_call_args(args: &[String]) -> Result<CallArgs, String> {
    let mut out = CallArgs::default();
    let mut passthrough = false;
    let mut i = 0;
    while i < args.len() {
        let item = args[i].as_str();
        if passthrough {
            out.rest.push(item.to_string());
            i += 1;
            continue;
        }
        match item {
            "--" => passthrough = true,
            "--help" | "-h" => out.help = true,
            "--json" | "--json=true" => out.parse_text_json = true,
            "--json=false" => out.parse_text_json = false,
            "--server" => {
                i += 1;
                out.server = args
                    .get(i)
                    .ok_or_else(|| "missing value for --server".to_string())?
                    .clone();
            }
            "--tool" => {
                i += 1;
                out.tool = args
                    .get(i)
                    .ok_or_else(|| "missing value for --tool".to_string())?
                    .clone();
            }
            _ => {
                if let Some(value) = item.strip_prefix("--server=") {
                    out.server = value.to_string();
                } else if let Some(value) = item.strip_prefix("--tool=") {
                    out.tool = value.to_string();
                } else {
                    out.rest.push(item.to_string());
                }
            }
        }
        i += 1;
    }
    Ok(out)
}

/// Turn `--key value`, `--key=value`, and bare `--flag` runs into a typed
/// argument map.
pub fn parse_dynamic_args(args: &[String]) -> Map<String, Value> {
    let mut out = Map::new();
    let mut i = 0;
    while i < args.len() {
        let item = args[i].as_str();
        if let Some(key) = item.strip_prefix("--") {
            if let Some((key, value)) = key.split_once('=') {
                out.insert(key.to_string(), coerce(value));
            } else if args.get(i + 1).is_some_and(|next| !next.starts_with("--")) {
                out.insert(key.to_string(), coerce(&args[i + 1]));
                i += 1;
            } else {
                out.insert(key.to_string(), Value::Bool(true));
            }
        }
        i += 1;
    }
    out
}

fn coerce(value: &str) -> Value {
    if let Ok(b) = value.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = value.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = value.parse::<f64>() {
        return Value::from(f);
    }
    Value::String(value.to_string())
}

/// Replace `text` fields whose contents look like JSON with the parsed
/// value, recursively. Used by `call --json`.
pub fn parse_json_like_text(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| {
                    if key == "text" {
                        if let Value::String(ref text) = item {
                            if let Some(parsed) = try_parse_json(text) {
                                return (key, parsed);
                            }
                        }
                    }
                    (key, parse_json_like_text(item))
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.into_iter().map(parse_json_like_text).collect())
        }
        other => other,
    }
}

fn try_parse_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn call_args_flags_and_rest() {
        let parsed = parse_call_args(&strings(&[
            "--server", "notion", "--tool", "search", "--query", "roadmap",
        ]))
        .unwrap();
        assert_eq!(parsed.server, "notion");
        assert_eq!(parsed.tool, "search");
        assert_eq!(parsed.rest, strings(&["--query", "roadmap"]));
        assert!(!parsed.help);
    }

    #[test]
    fn call_args_equals_forms() {
        let parsed =
            parse_call_args(&strings(&["--server=notion", "--tool=search", "--json"])).unwrap();
        assert_eq!(parsed.server, "notion");
        assert_eq!(parsed.tool, "search");
        assert!(parsed.parse_text_json);
    }

    #[test]
    fn call_args_passthrough_preserves_reserved_names() {
        let parsed = parse_call_args(&strings(&[
            "--server", "a", "--tool", "t", "--", "--server", "x", "--help",
        ]))
        .unwrap();
        assert_eq!(parsed.rest, strings(&["--server", "x", "--help"]));
        assert!(!parsed.help);
    }

    #[test]
    fn call_args_missing_value() {
        assert!(parse_call_args(&strings(&["--server"])).is_err());
    }

    #[test]
    fn dynamic_args_type_coercion() {
        let args = parse_dynamic_args(&strings(&[
            "--query", "roadmap", "--limit", "5", "--ratio", "0.5", "--exact", "true", "--flag",
        ]));
        assert_eq!(args["query"], json!("roadmap"));
        assert_eq!(args["limit"], json!(5));
        assert_eq!(args["ratio"], json!(0.5));
        assert_eq!(args["exact"], json!(true));
        assert_eq!(args["flag"], json!(true));
    }

    #[test]
    fn dynamic_args_equals_form() {
        let args = parse_dynamic_args(&strings(&["--query=road map"]));
        assert_eq!(args["query"], json!("road map"));
    }

    #[test]
    fn dynamic_args_ignores_positionals() {
        let args = parse_dynamic_args(&strings(&["stray", "--key", "v"]));
        assert_eq!(args.len(), 1);
        assert_eq!(args["key"], json!("v"));
    }

    #[test]
    fn json_like_text_is_expanded() {
        let input = json!({
            "content": [{"type": "text", "text": "{\"pages\": 3}"}]
        });
        let parsed = parse_json_like_text(input);
        assert_eq!(parsed["content"][0]["text"]["pages"], json!(3));
    }

    #[test]
    fn non_json_text_is_untouched() {
        let input = json!({"content": [{"type": "text", "text": "plain words"}]});
        let parsed = parse_json_like_text(input.clone());
        assert_eq!(parsed, input);
    }
}
