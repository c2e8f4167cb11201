//! Shell wrapper generation for server aliases.
//!
//! `mcpshim script` prints shell functions to source; `--install` writes
//! one executable wrapper per server so aliases work from any shell.

use anyhow::{anyhow, Result};
use mcpshim_core::protocol::ServerInfo;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Print shell functions for every server alias.
pub fn print_alias_script(items: &[ServerInfo]) {
    println!("# source this in your shell");
    for item in items {
        let name = wrapper_name(item);
        if name.is_empty() {
            continue;
        }
        println!("{name}() {{");
        println!(
            "  if [ $# -lt 1 ]; then mcpshim tools --server {}; return 1; fi",
            shell_quote(&item.name)
        );
        println!(
            "  mcpshim call --server {} --tool \"$1\" \"${{@:2}}\"",
            shell_quote(&item.name)
        );
        println!("}}\n");
    }
}

/// Write one executable wrapper per server into `dir`.
pub fn install_alias_scripts(dir: &Path, items: &[ServerInfo]) -> Result<usize> {
    if dir.as_os_str().is_empty() {
        return Err(anyhow!("directory is required"));
    }
    std::fs::create_dir_all(dir)?;

    let mut installed = 0;
    for item in items {
        let name = wrapper_name(item);
        if name.is_empty() {
            continue;
        }
        let quoted = shell_quote(&item.name);
        let content = format!(
            "#!/usr/bin/env bash\n\
             set -euo pipefail\n\
             if [ $# -lt 1 ]; then\n\
             \x20\x20mcpshim tools --server {quoted}\n\
             \x20\x20exit 1\n\
             fi\n\
             tool=$1\n\
             shift\n\
             exec mcpshim call --server {quoted} --tool \"$tool\" \"$@\"\n"
        );

        let path = dir.join(&name);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o755)
            .open(&path)?;
        file.write_all(content.as_bytes())?;
        installed += 1;
    }
    Ok(installed)
}

fn wrapper_name(item: &ServerInfo) -> String {
    if !item.alias.is_empty() {
        item.alias.clone()
    } else {
        item.name.clone()
    }
}

fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn server(name: &str, alias: &str) -> ServerInfo {
        ServerInfo {
            name: name.to_string(),
            alias: alias.to_string(),
            url: "https://example.test".to_string(),
            transport: "http".to_string(),
            has_auth: false,
        }
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("notion"), "'notion'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn install_writes_executable_wrappers() {
        let dir = TempDir::new().unwrap();
        let count = install_alias_scripts(
            dir.path(),
            &[server("notion-mcp", "notion"), server("jira", "")],
        )
        .unwrap();
        assert_eq!(count, 2);

        let wrapper = dir.path().join("notion");
        let content = std::fs::read_to_string(&wrapper).unwrap();
        assert!(content.contains("mcpshim call --server 'notion-mcp'"));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&wrapper).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);

        assert!(dir.path().join("jira").exists());
    }
}
