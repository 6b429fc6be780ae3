//! Host process for the session engine. Serves the framed protocol on a
//! Unix socket; every connection creates or attaches to a session.
//!
//! Usage: relay-session-engine <socket-path> [config.json]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_session_engine::{serve_connection, Dispatcher, EngineConfig, Registry, SideChannelCommand};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "relay_session_engine=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: relay-session-engine <socket-path> [config.json]");
        process::exit(2);
    }
    let socket_path = PathBuf::from(&args[1]);
    let config = match EngineConfig::load(args.get(2).map(Path::new)) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "cannot load configuration");
            process::exit(1);
        }
    };

    let mut dispatcher = Dispatcher::new();
    for command in SideChannelCommand::ALL {
        dispatcher.register(command, |event| async move {
            info!(
                session = %event.session_id,
                command = %event.command,
                params = %event.params,
                "side-channel request"
            );
            Ok(())
        });
    }

    let (registry, registry_task) = Registry::spawn(config.clone(), dispatcher);
    match registry.sweep_orphans().await {
        Ok(0) => {}
        Ok(found) => warn!(found, "terminating sessions left by a previous run"),
        Err(err) => warn!(%err, "orphan sweep failed"),
    }

    // Clean up stale socket from previous crash
    let _ = fs::remove_file(&socket_path);
    if let Some(parent) = socket_path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(socket = %socket_path.display(), %err, "failed to bind socket");
            process::exit(1);
        }
    };

    let signals = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    );
    let (mut sigterm, mut sigint, mut sighup) = match signals {
        (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
        _ => {
            error!("failed to install signal handlers");
            let _ = fs::remove_file(&socket_path);
            process::exit(1);
        }
    };

    info!(socket = %socket_path.display(), pid = process::id(), "session engine listening");

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(stream, registry.clone(), config.transport.clone()));
                }
                Err(err) => warn!(%err, "accept failed"),
            },
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            // detached from any terminal; nothing to do
            _ = sighup.recv() => debug!("ignoring SIGHUP"),
        }
    }

    info!("shutting down");
    drop(listener);
    if let Err(err) = registry.shutdown().await {
        warn!(%err, "registry shutdown failed");
    }
    let _ = registry_task.await;
    let _ = fs::remove_file(&socket_path);
}
