//! mcpshim - command-line client for the mcpshim daemon.
//!
//! Talks to `mcpshimd` over its unix socket. When invoked through a
//! symlink or wrapper named after a server alias, the process name picks
//! the server and the first argument the tool.

mod dynargs;
mod output;
mod script;
mod socket;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use mcpshim_core::config::{self, Config};
use mcpshim_core::protocol::{Action, Request, ToolDetail};
use mcpshim_mcp::Registry;
use mcpshim_store::{Store, StoreTokens};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mcpshim", version, about = "Command-line client for the mcpshim daemon")]
struct Cli {
    /// Unix socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers
    Servers,
    /// List tools across servers
    Tools {
        /// Server name or alias
        #[arg(long)]
        server: Option<String>,
        /// Show full tool descriptions
        #[arg(long)]
        full: bool,
    },
    /// Show a tool's parameters
    Inspect {
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        tool: Option<String>,
        /// Positional form: inspect <server> <tool>
        #[arg(value_name = "SERVER/TOOL", num_args = 0..)]
        positional: Vec<String>,
    },
    /// Call a tool with dynamic --arg flags
    #[command(disable_help_flag = true)]
    Call {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
        rest: Vec<String>,
    },
    /// Add or update a server
    Add {
        #[arg(long)]
        name: String,
        /// Short alias (defaults to the name)
        #[arg(long)]
        alias: Option<String>,
        /// MCP endpoint for http/sse transports
        #[arg(long)]
        url: Option<String>,
        /// http|sse|stdio
        #[arg(long, default_value = "http")]
        transport: String,
        /// Request header KEY=VALUE (repeatable)
        #[arg(long = "header", value_name = "KEY=VALUE")]
        headers: Vec<String>,
        /// Command and args for stdio transport (repeatable)
        #[arg(long = "command", value_name = "ARG")]
        command: Vec<String>,
        /// Environment KEY=VALUE for stdio transport (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,
    },
    /// Update stored settings
    Set {
        #[command(subcommand)]
        command: SetCommands,
    },
    /// Remove a server
    Remove {
        #[arg(long)]
        name: String,
    },
    /// Daemon status
    Status,
    /// Recent call history
    History {
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        tool: Option<String>,
        /// Max entries to return (1-500)
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Ask the daemon to re-read its config
    Reload,
    /// Validate a config file without the daemon
    Validate {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Complete OAuth login for a server
    Login {
        #[arg(long)]
        server: Option<String>,
        /// Complete oauth by pasting the redirect url/code
        #[arg(long)]
        manual: bool,
        #[arg(value_name = "SERVER")]
        positional: Option<String>,
    },
    /// Emit shell wrappers for server aliases
    Script {
        /// Install executable wrappers instead of printing
        #[arg(long)]
        install: bool,
        /// Target directory for wrappers
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SetCommands {
    /// Merge auth headers into a server entry
    Auth {
        #[arg(long)]
        server: String,
        /// Request header KEY=VALUE (repeatable)
        #[arg(long = "header", value_name = "KEY=VALUE")]
        headers: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    let binary = args
        .first()
        .map(|arg0| {
            Path::new(arg0)
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default()
        })
        .unwrap_or_default();

    // Symlinked as a server alias: `<alias> <tool> [--arg value ...]`.
    if !binary.is_empty() && binary != "mcpshim" {
        return run_alias(&binary, &args[1..]).await;
    }

    let cli = Cli::parse();
    let socket_path = cli
        .socket
        .clone()
        .unwrap_or_else(config::default_socket_path);
    let json_out = cli.json || !std::io::stdout().is_terminal();

    match cli.command {
        Commands::Servers => send_and_print(Request::new(Action::Servers), &socket_path, json_out).await,
        Commands::Tools { server, full } => {
            let mut req = Request::new(Action::Tools);
            req.server = server.unwrap_or_default();
            match socket::call(&req, &socket_path).await {
                Ok(resp) if !json_out && resp.ok => {
                    output::print_tools_list(resp.tools.as_deref().unwrap_or_default(), full);
                    0
                }
                Ok(resp) => output::print_response(&resp, json_out),
                Err(err) => fail(err),
            }
        }
        Commands::Inspect {
            server,
            tool,
            positional,
        } => {
            let mut positional = positional.into_iter();
            let server = server.or_else(|| positional.next()).unwrap_or_default();
            let tool = tool.or_else(|| positional.next()).unwrap_or_default();
            if server.is_empty() || tool.is_empty() {
                eprintln!("usage: mcpshim inspect --server <name> --tool <tool>");
                return 1;
            }
            let mut req = Request::new(Action::Inspect);
            req.server = server;
            req.tool = tool;
            send_and_print(req, &socket_path, json_out).await
        }
        Commands::Call { rest } => run_call(&rest, &socket_path, json_out).await,
        Commands::Add {
            name,
            alias,
            url,
            transport,
            headers,
            command,
            env,
        } => {
            let headers = match parse_header_args(&headers) {
                Ok(headers) => headers,
                Err(err) => return fail(err),
            };
            let mut req = Request::new(Action::AddServer);
            req.name = name;
            req.alias = alias.unwrap_or_default();
            req.url = url.unwrap_or_default();
            req.transport = transport;
            req.headers = headers;
            req.command = command;
            req.env = env;
            send_and_print(req, &socket_path, json_out).await
        }
        Commands::Set {
            command: SetCommands::Auth { server, headers },
        } => {
            let headers = match parse_header_args(&headers) {
                Ok(headers) => headers,
                Err(err) => return fail(err),
            };
            let mut req = Request::new(Action::SetAuth);
            req.name = server;
            req.headers = headers;
            send_and_print(req, &socket_path, json_out).await
        }
        Commands::Remove { name } => {
            let mut req = Request::new(Action::RemoveServer);
            req.name = name;
            send_and_print(req, &socket_path, json_out).await
        }
        Commands::Status => send_and_print(Request::new(Action::Status), &socket_path, json_out).await,
        Commands::History {
            server,
            tool,
            limit,
        } => {
            let mut req = Request::new(Action::History);
            req.server = server.unwrap_or_default();
            req.tool = tool.unwrap_or_default();
            req.limit = limit;
            send_and_print(req, &socket_path, json_out).await
        }
        Commands::Reload => send_and_print(Request::new(Action::Reload), &socket_path, json_out).await,
        Commands::Validate { config: path } => {
            let path = path.unwrap_or_else(config::default_config_path);
            match Config::load(&path) {
                Ok(_) => {
                    println!("config is valid: {}", path.display());
                    0
                }
                Err(err) => fail(err),
            }
        }
        Commands::Login {
            server,
            manual,
            positional,
        } => {
            let Some(server) = server.or(positional).filter(|s| !s.is_empty()) else {
                eprintln!("usage: mcpshim login --server <name>");
                return 1;
            };
            run_login(&server, manual).await
        }
        Commands::Script { install, dir } => run_script(install, dir, &socket_path).await,
    }
}

async fn run_alias(binary: &str, args: &[String]) -> i32 {
    let Some(tool) = args.first() else {
        eprintln!("{binary} requires a tool name");
        return 1;
    };
    let mut req = Request::new(Action::Call);
    req.server = binary.to_string();
    req.tool = tool.clone();
    req.args = Some(dynargs::parse_dynamic_args(&args[1..]));

    match socket::call(&req, &config::default_socket_path()).await {
        Ok(resp) => output::print_response(&resp, true),
        Err(err) => fail(err),
    }
}

async fn run_call(rest: &[String], socket_path: &Path, json_out: bool) -> i32 {
    let parsed = match dynargs::parse_call_args(rest) {
        Ok(parsed) => parsed,
        Err(err) => return fail(err),
    };

    let mut server = parsed.server;
    let mut tool = parsed.tool;
    let mut rest = parsed.rest;
    if server.is_empty() && !rest.is_empty() {
        server = rest.remove(0);
    }
    if tool.is_empty() && !rest.is_empty() {
        tool = rest.remove(0);
    }
    if server.is_empty() || tool.is_empty() {
        eprintln!("usage: mcpshim call --server <name> --tool <tool> [--flag value ...]");
        return 1;
    }

    if parsed.help {
        return print_call_help(&server, &tool, socket_path).await;
    }

    let args = dynargs::parse_dynamic_args(&rest);

    // Preflight required arguments against the tool schema when the
    // daemon can serve it; skipped silently when it cannot.
    if let Ok(detail) = fetch_tool_detail(&server, &tool, socket_path).await {
        let missing: Vec<&str> = detail
            .properties
            .iter()
            .filter(|prop| prop.required && !args.contains_key(&prop.name))
            .map(|prop| prop.name.as_str())
            .collect();
        if !missing.is_empty() {
            eprint!("missing required argument(s):");
            for name in &missing {
                eprint!(" --{name}");
            }
            eprintln!("\n");
            output::print_tool_detail(&detail);
            return 1;
        }
    }

    let mut req = Request::new(Action::Call);
    req.server = server;
    req.tool = tool;
    req.args = Some(args);

    match socket::call(&req, socket_path).await {
        Ok(mut resp) => {
            if parsed.parse_text_json {
                if let Some(result) = resp.result.take() {
                    resp.result = Some(dynargs::parse_json_like_text(result));
                }
            }
            output::print_response(&resp, json_out)
        }
        Err(err) => fail(err),
    }
}

async fn print_call_help(server: &str, tool: &str, socket_path: &Path) -> i32 {
    println!("usage: mcpshim call --server {server} --tool {tool} [--json] [--arg value ...]");
    println!("       mcpshim call --server <name> --tool <tool> -- [--reserved-arg value ...]");
    println!("       --json parses JSON-like content text fields in tool results");
    println!();
    match fetch_tool_detail(server, tool, socket_path).await {
        Ok(detail) => {
            output::print_tool_detail(&detail);
            0
        }
        Err(err) => {
            eprintln!("failed to load tool details: {err}");
            1
        }
    }
}

async fn fetch_tool_detail(
    server: &str,
    tool: &str,
    socket_path: &Path,
) -> anyhow::Result<ToolDetail> {
    let mut req = Request::new(Action::Inspect);
    req.server = server.to_string();
    req.tool = tool.to_string();
    let resp = socket::call(&req, socket_path).await?;
    if !resp.ok {
        return Err(anyhow!(resp.error));
    }
    resp.tool_detail
        .ok_or_else(|| anyhow!("tool details not available"))
}

/// OAuth login runs locally (not through the daemon) so the browser and
/// manual paste-in happen in the caller's terminal.
async fn run_login(server: &str, manual: bool) -> i32 {
    match login_local(server, manual).await {
        Ok(()) => {
            println!("oauth login completed for {server}");
            0
        }
        Err(err) => fail(err),
    }
}

async fn login_local(server: &str, manual: bool) -> anyhow::Result<()> {
    let cfg = Config::load(&config::default_config_path())?;
    let store = Arc::new(Store::open(&cfg.server.db_path).await?);
    let registry = Registry::new(Arc::new(cfg), Arc::new(StoreTokens(store)));

    tokio::time::timeout(
        std::time::Duration::from_secs(6 * 60),
        registry.login(server, manual),
    )
    .await
    .map_err(|_| anyhow!("timed out waiting for oauth login"))??;
    Ok(())
}

async fn run_script(install: bool, dir: Option<PathBuf>, socket_path: &Path) -> i32 {
    let resp = match socket::call(&Request::new(Action::Servers), socket_path).await {
        Ok(resp) => resp,
        Err(err) => return fail(err),
    };
    if !resp.ok {
        eprintln!("{}", resp.error);
        return 1;
    }
    let servers = resp.servers.unwrap_or_default();

    if install {
        let dir = dir.unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_default())
                .join(".local")
                .join("bin")
        });
        match script::install_alias_scripts(&dir, &servers) {
            Ok(count) => {
                println!("installed {count} wrappers in {}", dir.display());
                0
            }
            Err(err) => fail(err),
        }
    } else {
        script::print_alias_script(&servers);
        0
    }
}

async fn send_and_print(req: Request, socket_path: &Path, json_out: bool) -> i32 {
    match socket::call(&req, socket_path).await {
        Ok(resp) => output::print_response(&resp, json_out),
        Err(err) => fail(err),
    }
}

fn parse_header_args(
    headers: &[String],
) -> Result<std::collections::BTreeMap<String, String>, anyhow::Error> {
    let mut out = std::collections::BTreeMap::new();
    for entry in headers {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(anyhow!("invalid header {entry:?}, expected key=value"));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("header key cannot be empty"));
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    Ok(out)
}

fn fail(err: impl std::fmt::Display) -> i32 {
    eprintln!("{err}");
    1
}
