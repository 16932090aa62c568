use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use clap::Parser;
use mcp_server_rs::config::Config;
use mcp_server_rs::server::{
    McpServer, Namespace, PromptDef, ResourceDef, ServerOptions, ToolDef,
};
use mcp_server_rs::transport::http::StreamableHttpTransport;
use mcp_server_rs::transport::stdio::StdioTransport;
use mcp_server_rs::types::{
    CallToolResult, ElicitAction, GetPromptResult, MessageContent, PromptMessage,
    ReadResourceResult, Role,
};
use mcp_server_rs::Error;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mcp-server", version, about = "Demo MCP server over streamable HTTP or stdio")]
struct Args {
    /// JSON config file. Every key is optional.
    #[arg(long, env = "MCP_SERVER_CONFIG")]
    config: Option<String>,

    /// Serve over stdin/stdout instead of HTTP.
    #[arg(long, env = "MCP_SERVER_STDIO", default_value_t = false)]
    stdio: bool,

    /// Address to listen on; overrides `http.bind` from the config.
    #[arg(long, env = "MCP_SERVER_BIND")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol in stdio mode, so logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_config(path).with_context(|| format!("load config {path}"))?,
        None => Config::default(),
    };

    let server = McpServer::new(config.server_options());
    register_demo(&server);

    if args.stdio {
        info!("serving over stdio");
        server.serve(Arc::new(StdioTransport::stdio())).await?;
        return Ok(());
    }

    let addr: SocketAddr = match args.bind {
        Some(addr) => addr,
        None => config
            .http
            .bind
            .parse()
            .with_context(|| format!("invalid bind address {}", config.http.bind))?,
    };
    let transport = StreamableHttpTransport::new(server, config.http_options());
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, path = %config.http.path, "serving streamable HTTP");
    axum::serve(listener, transport.router())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn register_demo(server: &McpServer) {
    server.use_middleware(|ctx, next| {
        Box::pin(async move {
            let started = Instant::now();
            let method = ctx.method.clone();
            let outcome = next.run(ctx).await;
            tracing::debug!(%method, elapsed = ?started.elapsed(), "handled");
            outcome
        })
    });

    server.tool(
        ToolDef::new("echo")
            .description("Returns its arguments")
            .input_schema(json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })),
        |args, _ctx| async move {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            Ok(CallToolResult::text(text))
        },
    );

    server.tool(
        ToolDef::new("count")
            .description("Counts to n, reporting progress")
            .input_schema(json!({
                "type": "object",
                "properties": {"n": {"type": "integer", "minimum": 1, "maximum": 100}},
                "required": ["n"]
            })),
        |args, ctx| async move {
            let n = args["n"].as_u64().unwrap_or(1);
            for i in 1..=n {
                ctx.progress(i as f64, Some(n as f64), None)?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(CallToolResult::structured(json!({ "counted": n })))
        },
    );

    server.tool(
        ToolDef::new("whoami").description("Asks the user for their name"),
        |_args, ctx| async move {
            let answer = ctx
                .elicit(
                    "What is your name?",
                    json!({
                        "type": "object",
                        "properties": {"name": {"type": "string"}},
                        "required": ["name"]
                    }),
                )
                .await?;
            let reply = match (answer.action, answer.content) {
                (ElicitAction::Accept, Some(content)) => format!(
                    "Hello, {}!",
                    content.get("name").and_then(Value::as_str).unwrap_or("stranger")
                ),
                _ => "No name given.".to_string(),
            };
            Ok::<_, Error>(CallToolResult::text(reply))
        },
    );

    let math = McpServer::new(ServerOptions::new("math", env!("CARGO_PKG_VERSION")));
    math.tool(
        ToolDef::new("add")
            .description("Adds two numbers")
            .input_schema(json!({
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }))
            .output_schema(json!({
                "type": "object",
                "properties": {"sum": {"type": "number"}},
                "required": ["sum"]
            })),
        |args, _ctx| async move {
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            Ok(CallToolResult::structured(json!({ "sum": sum })))
        },
    );
    server.group(Namespace::Prefix("math".to_string()), &math);

    server.prompt(
        PromptDef::new("greet")
            .description("A friendly greeting")
            .argument("name", "Who to greet", true),
        |args, _ctx| async move {
            let name = args
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(GetPromptResult {
                description: Some("Greeting".to_string()),
                messages: vec![PromptMessage {
                    role: Role::User,
                    content: MessageContent::text(format!("Please greet {name} warmly.")),
                }],
            })
        },
    );

    server.resource(
        ResourceDef::new("demo://readme", "readme").mime_type("text/plain"),
        |req, _ctx| async move {
            Ok(ReadResourceResult::text(
                req.uri,
                "This server exposes echo, count, whoami and math/add.",
            ))
        },
    );
    server.resource(
        ResourceDef::new("demo://notes/{id}", "note").mime_type("text/plain"),
        |req, _ctx| async move {
            let id = req.variables.get("id").cloned().unwrap_or_default();
            Ok(ReadResourceResult::text(req.uri, format!("Note #{id}")))
        },
    );
}
