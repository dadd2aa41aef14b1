use super::{connect, select_backend, submit};
use crate::config::AgentConfig;
use crate::source::FileTargetSource;
use anyhow::{Context, Result};
use edge_orchestration::Notification;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use smol::Timer;
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn run(config: &AgentConfig) -> Result<()> {
    let mut source = FileTargetSource::new(&config.target_path);
    let initial = match source.poll().await {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "Starting without a target state");
            None
        }
    };

    let backend = select_backend(config, initial.as_ref());
    let engine = connect(config, backend).await?;
    if let Some(target) = initial {
        submit(&engine, backend, target).await;
    }

    // Closing the channel wakes every loop below at once
    let (stop_tx, stop_rx) = async_channel::bounded::<()>(1);
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    let signal_handle = signals.handle();
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Shutdown requested");
        }
        stop_tx.close();
    });

    let notifications = engine.subscribe().await;
    let poll_every = Duration::from_secs(config.target_poll_secs.max(1));

    let watch_target = async {
        loop {
            let stopped = smol::future::or(
                async {
                    let _ = stop_rx.recv().await;
                    true
                },
                async {
                    Timer::after(poll_every).await;
                    false
                },
            )
            .await;
            if stopped {
                break;
            }
            // Read failures are logged by the source
            if let Ok(Some(target)) = source.poll().await {
                submit(&engine, backend, target).await;
            }
        }
    };

    let log_notifications = async {
        loop {
            let next = smol::future::or(
                async { notifications.recv().await.ok() },
                async {
                    let _ = stop_rx.recv().await;
                    None
                },
            )
            .await;
            match next {
                Some(notification) => log_notification(&notification),
                None => break,
            }
        }
    };

    info!(
        backend = %backend,
        target = %config.target_path.display(),
        "Edge agent running"
    );
    futures::join!(engine.run(stop_rx.clone()), watch_target, log_notifications);

    signal_handle.close();
    engine
        .shutdown(config.shutdown_grace())
        .await
        .context("Driver shutdown failed")?;
    info!("Edge agent stopped");
    Ok(())
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::ServiceStarted {
            service_name,
            container_id,
        } => info!(service = %service_name, container = %container_id, "Service started"),
        Notification::ServiceStopped {
            service_name,
            container_id,
            exit_code,
        } => info!(
            service = %service_name,
            container = %container_id,
            exit_code = ?exit_code,
            "Service stopped"
        ),
        Notification::ServiceError {
            service_name,
            error,
        } => warn!(
            service = %service_name,
            kind = ?error.kind,
            retry_count = error.retry_count,
            next_retry = ?error.next_retry,
            "Service error: {}",
            error.message
        ),
        Notification::HealthChanged {
            service_name,
            health,
        } => info!(service = %service_name, health = ?health, "Health changed"),
        Notification::ReconciliationComplete { result } => debug!(
            version = result.target_version,
            created = result.services_created,
            updated = result.services_updated,
            removed = result.services_removed,
            errors = result.errors.len(),
            "Reconciliation complete"
        ),
    }
}
