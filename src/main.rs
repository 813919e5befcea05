// mcp-conduit - Command Line Entry Point
//
// Talks to one MCP server, either named in the config file or given ad hoc
// with --command/--arg (stdio) or --url/--header (HTTP), and prints results
// as JSON on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcp_conduit::client::{ClientConfig, McpClient};
use mcp_conduit::config::{Config, ServerConfig, TransportKind};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// mcp-conduit: Model Context Protocol client
#[derive(Parser, Debug)]
#[command(name = "mcp-conduit")]
#[command(author = "mcp-conduit Contributors")]
#[command(version)]
#[command(about = "Inspect and call MCP servers over stdio or HTTP", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (compact, pretty, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Configuration file (default: ~/.config/mcp-conduit/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Name of a server from the configuration file
    #[arg(short, long, global = true)]
    server: Option<String>,

    /// Spawn this command as a stdio MCP server
    #[arg(long, global = true, conflicts_with = "url")]
    command: Option<String>,

    /// Argument for --command (repeatable)
    #[arg(long = "arg", global = true, allow_hyphen_values = true)]
    command_args: Vec<String>,

    /// Connect to an HTTP MCP endpoint
    #[arg(long, global = true)]
    url: Option<String>,

    /// Extra HTTP header as "Name: value" (repeatable)
    #[arg(long = "header", global = true)]
    headers: Vec<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command_kind: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show server identity, capabilities and instructions
    Info,
    /// List tools
    Tools,
    /// Call a tool
    Call {
        /// Tool name
        name: String,

        /// Tool arguments as a JSON object
        #[arg(long)]
        arguments: Option<String>,
    },
    /// List resources
    Resources,
    /// List resource templates
    Templates,
    /// Read a resource
    Read {
        /// Resource URI
        uri: String,
    },
    /// List prompts
    Prompts,
    /// Render a prompt
    Prompt {
        /// Prompt name
        name: String,

        /// Prompt argument as key=value (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_tracing(&args, &config)?;

    let target = resolve_target(&args, &config)?;
    info!(
        "mcp-conduit v{} connecting over {:?}",
        env!("CARGO_PKG_VERSION"),
        target.transport
    );

    let transport = target.connect()?;
    let mut client = McpClient::from_boxed(transport, ClientConfig::default());

    let outcome = run(&mut client, args.command_kind).await;

    if let Err(e) = client.close().await {
        warn!("Failed to close MCP transport: {}", e);
    }

    outcome
}

fn init_tracing(args: &Args, config: &Config) -> Result<()> {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let format = args
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        );

    match format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        other => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", other),
    }

    Ok(())
}

/// Work out which server to talk to. Ad-hoc flags win over the config file.
fn resolve_target(args: &Args, config: &Config) -> Result<ServerConfig> {
    let mut target = if let Some(url) = &args.url {
        let headers = args
            .headers
            .iter()
            .map(|header| parse_header(header))
            .collect::<Result<BTreeMap<_, _>>>()?;
        ServerConfig {
            transport: TransportKind::Http,
            url: Some(url.clone()),
            headers,
            ..Default::default()
        }
    } else if let Some(command) = &args.command {
        ServerConfig {
            transport: TransportKind::Stdio,
            command: command.clone(),
            args: args.command_args.clone(),
            ..Default::default()
        }
    } else if let Some(name) = &args.server {
        config.server(name)?.clone()
    } else if config.servers.len() == 1 {
        config
            .servers
            .values()
            .next()
            .cloned()
            .context("configured server disappeared")?
    } else {
        anyhow::bail!("No server selected. Use --server, --command or --url.");
    };

    if let Some(timeout) = args.timeout {
        anyhow::ensure!(timeout > 0, "--timeout must be > 0");
        target.timeout_secs = timeout;
    }

    Ok(target)
}

async fn run(client: &mut McpClient, command: Commands) -> Result<()> {
    client
        .initialize()
        .await
        .context("Failed to initialize MCP client")?;

    match command {
        Commands::Info => {
            print_json(&json!({
                "serverInfo": client.server_info(),
                "protocolVersion": client.initialize_result().map(|r| r.protocol_version.as_str()),
                "capabilities": client.capabilities(),
                "instructions": client.instructions(),
                "sessionId": client.session_id(),
            }))?;
        }
        Commands::Tools => {
            let tools = client.list_tools().await.context("Failed to list tools")?;
            print_json(&tools)?;
        }
        Commands::Call { name, arguments } => {
            let arguments = arguments
                .as_deref()
                .map(parse_arguments)
                .transpose()?;
            let result = client
                .call_tool(&name, arguments)
                .await
                .with_context(|| format!("Failed to call tool '{}'", name))?
                .context("Server does not offer tools")?;
            print_json(&result)?;
            if result.is_error {
                anyhow::bail!("Tool '{}' reported an error", name);
            }
        }
        Commands::Resources => {
            let resources = client
                .list_resources()
                .await
                .context("Failed to list resources")?;
            print_json(&resources)?;
        }
        Commands::Templates => {
            let templates = client
                .list_resource_templates()
                .await
                .context("Failed to list resource templates")?;
            print_json(&templates)?;
        }
        Commands::Read { uri } => {
            let contents = client
                .read_resource(&uri)
                .await
                .with_context(|| format!("Failed to read resource '{}'", uri))?
                .context("Server does not offer resources")?;
            print_json(&contents)?;
        }
        Commands::Prompts => {
            let prompts = client.list_prompts().await.context("Failed to list prompts")?;
            print_json(&prompts)?;
        }
        Commands::Prompt { name, params } => {
            let arguments = params
                .iter()
                .map(|param| parse_key_value(param))
                .collect::<Result<BTreeMap<_, _>>>()?;
            let arguments = (!arguments.is_empty()).then_some(arguments);
            let prompt = client
                .get_prompt(&name, arguments)
                .await
                .with_context(|| format!("Failed to get prompt '{}'", name))?
                .context("Server does not offer prompts")?;
            print_json(&prompt)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{}", text);
    Ok(())
}

fn parse_header(header: &str) -> Result<(String, String)> {
    let (name, value) = header
        .split_once(':')
        .with_context(|| format!("Invalid header '{}', expected \"Name: value\"", header))?;
    let name = name.trim();
    anyhow::ensure!(!name.is_empty(), "Invalid header '{}': empty name", header);
    Ok((name.to_string(), value.trim().to_string()))
}

fn parse_key_value(param: &str) -> Result<(String, String)> {
    let (key, value) = param
        .split_once('=')
        .with_context(|| format!("Invalid parameter '{}', expected key=value", param))?;
    Ok((key.to_string(), value.to_string()))
}

fn parse_arguments(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("Tool arguments must be valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Tool arguments must be a JSON object, got {}", other),
    }
}
