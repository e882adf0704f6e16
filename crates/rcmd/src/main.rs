//! rcmd — connection manager daemon.
//!
//! Binds the CM port, listens on the configured services, and accepts
//! every request with a fresh queue pair from the in-process model.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use rcm_core::config::CmConfig;
use rcm_services::{CallbackOutcome, CmEvent, CmEventKind, CmHandler};
use rcmd::{AcceptParams, CmContext, SoftQp, UdpTransport};

/// First QPN handed out to accepted connections.
const FIRST_QPN: u32 = 0x100;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CmConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CmConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CmConfig::default()
    });

    let bind = SocketAddr::new(config.network.bind_addr, config.network.port);
    let socket = Arc::new(
        UdpSocket::bind(bind)
            .await
            .with_context(|| format!("failed to bind CM socket on {bind}"))?,
    );
    tracing::info!(
        addr = %bind,
        gid = %config.identity.port_gid,
        "rcmd starting"
    );

    let transport = Arc::new(UdpTransport::new(socket.clone(), config.network.port));
    let qp = Arc::new(SoftQp::new());
    let ctx = CmContext::new(&config, transport, qp);

    // ── Listeners ────────────────────────────────────────────────────────────
    let next_qpn = Arc::new(AtomicU32::new(FIRST_QPN));
    let handler: Arc<dyn CmHandler> = Arc::new(move |event: &CmEvent| {
        match &event.kind {
            CmEventKind::ReqReceived(req) => {
                let qpn = next_qpn.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
                tracing::info!(
                    comm_id = event.comm_id,
                    remote = %req.remote_gid,
                    qpn,
                    "accepting"
                );
                req.reply.set(AcceptParams {
                    qpn,
                    starting_psn: rand::random::<u32>() & 0x00ff_ffff,
                    responder_resources: req.initiator_depth,
                    initiator_depth: req.responder_resources,
                    rnr_retry_count: 7,
                    failover_accepted: req.alternate_path.is_some(),
                    ..AcceptParams::default()
                });
            }
            CmEventKind::Established => {
                tracing::info!(comm_id = event.comm_id, "connection established");
            }
            CmEventKind::Disconnected(reason) => {
                tracing::info!(comm_id = event.comm_id, reason = ?reason, "connection closed");
            }
            CmEventKind::Idle(reason) => {
                tracing::debug!(comm_id = event.comm_id, reason = ?reason, "connection idle");
            }
            _ => {}
        }
        CallbackOutcome::Proceed
    });
    for listener in &config.listeners {
        match ctx.listen(listener.service_id, listener.service_mask, handler.clone()) {
            Ok(_) => {}
            Err(e) => tracing::error!(
                service_id = %format_args!("0x{:016x}", listener.service_id),
                error = %e,
                "failed to listen"
            ),
        }
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let receive_task = tokio::spawn(rcmd::udp::receive_loop(socket, ctx.clone(), shutdown_rx));

    match receive_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "receive loop failed"),
        Err(e) => tracing::error!(error = %e, "receive task panicked"),
    }

    ctx.shutdown().await;
    tracing::info!("rcmd stopped");
    Ok(())
}
