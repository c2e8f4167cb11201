//! Human and JSON rendering of daemon responses.

use chrono::SecondsFormat;
use mcpshim_core::protocol::{Response, ToolDetail, ToolInfo};

/// Print a response and return the process exit code.
pub fn print_response(resp: &Response, json_out: bool) -> i32 {
    if json_out {
        match serde_json::to_string_pretty(resp) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => {
                eprintln!("failed to render response: {e}");
                return 1;
            }
        }
        return i32::from(!resp.ok);
    }

    if !resp.ok {
        eprintln!("{}", resp.error);
        return 1;
    }

    if let Some(text) = &resp.text {
        println!("{text}");
    }
    if let Some(status) = &resp.status {
        println!(
            "uptime={}s servers={} tools={}",
            status.uptime_sec, status.server_count, status.tool_count
        );
    }
    if let Some(servers) = &resp.servers {
        for server in servers {
            println!("{} ({}) {}", server.name, server.transport, server.url);
        }
    }
    if let Some(history) = &resp.history {
        for item in history {
            let status = if item.success { "ok" } else { "error" };
            println!(
                "{} {}/{} {} ({}ms)",
                item.at.to_rfc3339_opts(SecondsFormat::Secs, true),
                item.server,
                item.tool,
                status,
                item.duration_ms
            );
            if !item.success && !item.error.is_empty() {
                println!("  error: {}", item.error);
            }
            if let Some(args) = &item.args {
                if !args.is_empty() {
                    if let Ok(rendered) = serde_json::to_string(args) {
                        println!("  args: {rendered}");
                    }
                }
            }
        }
    }
    if let Some(tools) = &resp.tools {
        print_tools_list(tools, false);
    }
    if let Some(detail) = &resp.tool_detail {
        print_tool_detail(detail);
    }
    if let Some(result) = &resp.result {
        if let Ok(rendered) = serde_json::to_string_pretty(result) {
            println!("{rendered}");
        }
    }
    0
}

/// Render the tool listing, one line per tool, or the multi-line form
/// with descriptions when `full` is set.
pub fn print_tools_list(items: &[ToolInfo], full: bool) {
    if items.is_empty() {
        return;
    }

    let single_server = items.iter().all(|item| item.server == items[0].server);
    let display_name = |item: &ToolInfo| {
        if single_server {
            item.name.clone()
        } else {
            format!("{}/{}", item.server, item.name)
        }
    };

    if full {
        for (index, item) in items.iter().enumerate() {
            println!("{}", display_name(item));
            if !item.required.is_empty() {
                println!("  required: {}", item.required.join(", "));
            }
            if !item.properties.is_empty() {
                println!("  parameters: {}", item.properties.join(", "));
            }
            let detail = normalize_multiline(&item.description);
            if !detail.is_empty() {
                println!("  description:");
                for line in detail.lines() {
                    println!("    {line}");
                }
            }
            if index < items.len() - 1 {
                println!();
            }
        }
        return;
    }

    for item in items {
        let mut summary = summarize_description(&item.description);
        if !item.required.is_empty() {
            if !summary.is_empty() {
                summary.push(' ');
            }
            summary.push_str("required: ");
            summary.push_str(&item.required.join(","));
        }
        if summary.is_empty() {
            println!("{}", display_name(item));
        } else {
            println!("{:<30}  {}", display_name(item), summary);
        }
    }
}

/// Render an inspected tool with its parameter table.
pub fn print_tool_detail(detail: &ToolDetail) {
    println!("server: {}", detail.server);
    println!("tool:   {}", detail.name);
    if !detail.description.is_empty() {
        println!("\n{}", normalize_multiline(&detail.description));
    }
    if detail.properties.is_empty() {
        return;
    }
    println!("\nparameters:");
    for prop in &detail.properties {
        let required = if prop.required { " (required)" } else { "" };
        let mut kind = if prop.kind.is_empty() {
            "any".to_string()
        } else {
            prop.kind.clone()
        };
        if !prop.choices.is_empty() {
            kind.push_str(&format!(" enum({})", prop.choices.join("|")));
        }
        if !prop.constant.is_empty() {
            kind.push_str(&format!(" const({})", prop.constant));
        }
        if prop.description.is_empty() {
            println!("  --{:<20} {}{}", prop.name, kind, required);
        } else {
            let lines: Vec<&str> = prop
                .description
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .collect();
            let first = lines.first().copied().unwrap_or_default();
            println!("  --{:<20} {}{} - {}", prop.name, kind, required, first);
            for line in lines.iter().skip(1) {
                println!("  {:<20}   {}", "", line);
            }
        }
    }
}

/// Reduce a tool description to a one-line summary: first meaningful
/// line, first sentence, capped at 100 characters.
pub fn summarize_description(input: &str) -> String {
    let text = normalize_multiline(input);
    if text.is_empty() {
        return String::new();
    }

    let mut first_line = "";
    for line in text.lines() {
        let candidate = line.trim();
        if candidate.is_empty()
            || candidate.starts_with("<example")
            || candidate.starts_with("</example")
            || candidate.starts_with('{')
            || candidate.starts_with('[')
        {
            continue;
        }
        let candidate = candidate.trim_start_matches('#').trim();
        if candidate.is_empty() {
            continue;
        }
        first_line = candidate;
        break;
    }
    if first_line.is_empty() {
        return String::new();
    }

    let mut summary = first_line.to_string();
    if let Some(idx) = summary.find(". ") {
        summary.truncate(idx + 1);
    }
    if summary.chars().count() > 100 {
        summary = summary.chars().take(97).collect::<String>() + "...";
    }
    summary
}

/// Collapse runs of blank lines and trim each line, preserving paragraph
/// breaks.
pub fn normalize_multiline(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    let mut lines: Vec<String> = Vec::new();
    let mut blank = false;
    for raw in input.replace("\r\n", "\n").split('\n') {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            if !blank {
                blank = true;
                lines.push(String::new());
            }
            continue;
        }
        blank = false;
        lines.push(trimmed.to_string());
    }
    while lines.first().is_some_and(String::is_empty) {
        lines.remove(0);
    }
    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_blank_runs() {
        let input = "  first line  \n\n\n  second line \n\n";
        assert_eq!(normalize_multiline(input), "first line\n\nsecond line");
    }

    #[test]
    fn summarize_takes_first_sentence() {
        let text = "Searches the workspace. Supports filters.\nMore detail.";
        assert_eq!(summarize_description(text), "Searches the workspace.");
    }

    #[test]
    fn summarize_skips_examples_and_json() {
        let text = "<example>\n{\"a\": 1}\n</example>\n# Search tool\nbody";
        assert_eq!(summarize_description(text), "Search tool");
    }

    #[test]
    fn summarize_caps_length() {
        let text = "x".repeat(150);
        let summary = summarize_description(&text);
        assert_eq!(summary.chars().count(), 100);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn summarize_empty() {
        assert_eq!(summarize_description(""), "");
        assert_eq!(summarize_description("\n\n"), "");
    }
}
