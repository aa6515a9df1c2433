use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use device_relay::{
    config::Config,
    events::{init_logging, notice_channel, EventEmitter},
    http_api::relay_api_router,
    hub::Hub,
    keepalive,
    telegram::{api::TelegramApi, ControlChannel},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let (notices_tx, notices_rx) = notice_channel();
    let hub = Arc::new(Hub::new(
        cfg.pending_ttl(),
        notices_tx.clone(),
        EventEmitter::new(cfg.json_output),
    ));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let addr = cfg.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind relay on {addr}"))?;
    tracing::info!(addr = %addr, public_url = %cfg.public_base_url(), "relay listening");

    let router = relay_api_router(hub.clone(), notices_tx, cfg.static_dir.clone());
    let mut server_cancel = cancel_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_cancel.changed().await;
        };
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "relay server error");
        }
    });

    let control = match cfg.bot_token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => {
            let allowed = cfg.allowed_chat_ids();
            if allowed.is_empty() {
                tracing::warn!("no allowed chats configured; every operator message will be ignored");
            }
            let api = Arc::new(TelegramApi::with_base_url(token, &cfg.telegram_api_url));
            let channel = ControlChannel::new(api, hub.clone(), allowed, cfg.public_base_url());
            Some(tokio::spawn(channel.run(
                cfg.poll_timeout,
                notices_rx,
                cancel_rx.clone(),
            )))
        }
        None => {
            tracing::warn!("no bot token configured; control channel disabled");
            drop(notices_rx);
            None
        }
    };

    if let Some(url) = cfg.keepalive_url.clone() {
        tokio::spawn(keepalive::run(
            reqwest::Client::new(),
            url,
            cfg.keepalive_interval(),
            cancel_rx.clone(),
        ));
    }

    wait_for_shutdown().await?;
    tracing::info!("shutting down");
    let _ = cancel_tx.send(true);

    if let Some(control) = control {
        let _ = control.await;
    }
    if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
        tracing::warn!("server did not drain within 5s");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
