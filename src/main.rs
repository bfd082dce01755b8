use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};

use trinityd::backend::OpenAiBackend;
use trinityd::config::GatewayConfig;
use trinityd::ipc::{self, EventContext, IpcCallbacks};
use trinityd::rest;
use trinityd::storage::{DaemonEventRecord, Storage};
use trinityd::AppContext;

#[derive(Parser)]
#[command(
    name = "trinityd",
    about = "Trinity Gateway — multi-stage AI reasoning daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP API port
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// IPC WebSocket port
    #[arg(long, env = "IPC_PORT")]
    ipc_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG")]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default when no subcommand is given).
    Serve,
    /// Derive the AUTH_PASSWORD_HASH value for a salt/password pair.
    ///
    /// Prints the 128-char hex scrypt digest expected by the login route.
    HashPassword {
        #[arg(long)]
        salt: String,
        #[arg(long)]
        password: String,
    },
}

fn init_tracing(filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (all platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::HashPassword { salt, password }) = &args.command {
        let hash = trinityd::auth::hash_password(salt, password)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("{hash}");
        return Ok(());
    }

    // An unrecognized AUTH_MODE must abort startup with a non-zero exit.
    let config = GatewayConfig::new(args.port, args.ipc_port, args.log)?;
    init_tracing(&config.log);
    info!(
        port = config.port,
        ipc_port = config.ipc_port,
        auth_mode = %config.auth_mode,
        "starting trinityd"
    );

    let backend = Arc::new(OpenAiBackend::from_config(&config));
    let database_required = config.database_required;
    let database_url = config.database_url.clone();
    let mut ctx = AppContext::new(config, backend);

    match Storage::open(&database_url).await {
        Ok(storage) => {
            ctx = ctx.with_storage(Arc::new(storage));
            info!(url = %database_url, "audit database ready");
        }
        Err(e) if database_required => {
            return Err(e).context("DATABASE_REQUIRED is set and the database failed to open");
        }
        Err(e) => {
            warn!(err = %e, "database unavailable — audit persistence disabled");
        }
    }
    let ctx = Arc::new(ctx);

    // Daemon events flow into the audit log.
    let callbacks = IpcCallbacks {
        on_event: ctx.storage.clone().map(|storage| {
            let hook: ipc::EventCallback = Arc::new(move |event: EventContext| {
                let storage = Arc::clone(&storage);
                Box::pin(async move {
                    storage
                        .append_event(DaemonEventRecord {
                            event_type: event.event_type,
                            event_id: event.event_id,
                            user_id: event.user_id,
                            connection_id: event.connection_id,
                            payload: event.payload,
                        })
                        .await
                })
            });
            hook
        }),
        on_command_result: Some(Arc::new(|result| {
            info!(
                command_id = %result.command_id,
                connection_id = %result.connection_id,
                ok = result.ok,
                error = result.error.as_deref().unwrap_or("-"),
                "command result received"
            );
        })),
    };

    // One shutdown signal fans out to both servers.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = signal_tx.send(());
    });

    let mut http_rx = shutdown_tx.subscribe();
    let mut ipc_rx = shutdown_tx.subscribe();

    let http = tokio::spawn(rest::serve(Arc::clone(&ctx), async move {
        let _ = http_rx.recv().await;
    }));
    let ipc_server = tokio::spawn(ipc::run(Arc::clone(&ctx), callbacks, async move {
        let _ = ipc_rx.recv().await;
    }));

    let (http_result, ipc_result) = tokio::try_join!(http, ipc_server)?;
    http_result?;
    ipc_result?;

    info!("trinityd stopped");
    Ok(())
}
