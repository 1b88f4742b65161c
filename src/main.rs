//! remote-core: remote control command server
//!
//! Serves the HTTP command listener on the configured base port + 10 with a
//! small built-in command set. Host integrations register their own
//! commands on a `CommandTable` or implement `Dispatcher` directly.

use chrono::Local;
use remote_core::config::Config;
use remote_core::{CommandOutput, CommandTable, DispatchError, Router, Server, TemplateSet};
use std::fmt::Write;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let http_port = config.http_port()?;
    info!(
        host = %config.host,
        base_port = config.port,
        http_port,
        max_connections = config.max_connections,
        receive_buffer = config.receive_buffer_size,
        send_buffer = config.send_buffer_size,
        cache_build_hour = config.cache_build_hour,
        "Starting remote-core server"
    );

    let templates = TemplateSet::new(config.templates.clone());
    let router = Router::new(Arc::new(builtin_commands(&config)), Arc::new(templates));
    let server = Server::init(&config, router)?;

    let result = server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    // Bind failures skip the normal shutdown path
    server.clean_up_on_exit().await;
    result?;
    Ok(())
}

/// Commands available without a host application.
fn builtin_commands(config: &Config) -> CommandTable {
    let mut table = CommandTable::new();

    table.register("echo", "Server Commands", "echo <text>", |param| {
        Ok(CommandOutput::html(html_escape::encode_text(param).into_owned()))
    });

    table.register("time", "Server Commands", "time [strftime format]", |param| {
        let format = if param.is_empty() { "%Y-%m-%d %H:%M:%S" } else { param };
        let mut rendered = String::new();
        write!(rendered, "{}", Local::now().format(format))
            .map_err(|_| DispatchError::InvalidParam(format!("bad time format '{}'", format)))?;
        Ok(CommandOutput::html(rendered))
    });

    let info = serde_json::json!({
        "server": remote_core::response::SERVER_TOKEN,
        "base_port": config.port,
        "max_connections": config.max_connections,
        "send_buffer_size": config.send_buffer_size,
        "cache_build_hour": config.cache_build_hour,
    })
    .to_string();
    table.register("server-info", "Server Commands", "server-info", move |_| {
        Ok(CommandOutput::json(info.clone()))
    });

    table
}
