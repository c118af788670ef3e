use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use vectorset::config::Config;
use vectorset::engine::Engine;

pub async fn run(config: Config) -> anyhow::Result<()> {
    if let Some(ref dir) = config.data_dir {
        ensure_data_dir(dir)?;
        let abs_path = fs::canonicalize(dir)?;
        tracing::info!(path = %abs_path.display(), "data directory");
    }

    let shutdown_token = CancellationToken::new();
    let engine = Engine::new(config.clone(), shutdown_token.clone())?;

    let app = vectorset::api::router(engine.clone(), config.clone());
    let addr = SocketAddr::new(config.bind_addr, config.port);

    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_token))
        .await?;

    // the controller writes its final snapshot on a plain thread
    tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    tracing::info!("server stopped");
    Ok(())
}

fn ensure_data_dir(path: &str) -> anyhow::Result<()> {
    let p = Path::new(path);

    if !p.exists() {
        fs::create_dir_all(p)?;
    } else if !p.is_dir() {
        anyhow::bail!("DATA_DIR exists but is not a directory: {}", p.display());
    }

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            tracing::info!("received terminate signal, shutting down");
        },
    }

    token.cancel();
}
