// ── Background tasks ──
//
// Four tasks per interface, all stopped by the central's cancellation
// token: the apply task (sole writer of caches and entities), the
// callback task, the health task, and the command processor. Work in
// flight is abandoned on cancellation, so shutdown never waits on a
// backend call.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hmgate_api::{CallbackReceiver, ParamsetKind};

use super::interface::{Interface, Proposal, Update};
use crate::command::{Command, CommandEnvelope};
use crate::error::CoreError;
use crate::model::ValueSource;

/// Single writer for one interface's caches and entities. A proposal is
/// applied completely or, on shutdown, not at all.
pub(crate) async fn apply_task(
    iface: Arc<Interface>,
    mut rx: mpsc::UnboundedReceiver<Proposal>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            proposal = rx.recv() => {
                let Some(Proposal { update, ack }) = proposal else { break };
                iface.apply(update);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }
    debug!(interface_id = iface.id(), "apply task stopped");
}

/// Turns inbound callback events into proposals, in arrival order.
pub(crate) async fn callback_task(
    iface: Arc<Interface>,
    mut receiver: CallbackReceiver,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = receiver.recv() => {
                let Some(event) = event else { break };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = iface.handle_callback(event) => {}
                }
            }
        }
    }
    debug!(interface_id = iface.id(), "callback task stopped");
}

/// Probes while connected, reconnects while disconnected.
pub(crate) async fn health_task(iface: Arc<Interface>, cancel: CancellationToken) {
    loop {
        let delay = iface.next_health_delay().await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }

        if iface.state().is_usable() {
            let probe = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = iface.probe() => result,
            };
            match probe {
                Ok(()) => iface.record_success().await,
                Err(e) => iface.record_failure(&e.to_string()).await,
            }
            continue;
        }

        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = reconnect(&iface) => result,
        };
        match attempt {
            Ok(()) => {
                info!(interface_id = iface.id(), "reconnected");
                iface.record_success().await;
                spawn_refresh(&iface, &cancel);
            }
            Err(e) => {
                warn!(interface_id = iface.id(), error = %e, "reconnect attempt failed");
                iface.record_failure(&e.to_string()).await;
            }
        }
    }
    debug!(interface_id = iface.id(), "health task stopped");
}

async fn reconnect(iface: &Arc<Interface>) -> Result<(), CoreError> {
    iface.establish().await?;
    iface.probe().await
}

/// Re-read VALUES in the background; newer pushes win over the results.
pub(crate) fn spawn_refresh(iface: &Arc<Interface>, cancel: &CancellationToken) {
    let iface = Arc::clone(iface);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {}
            result = iface.refresh_values(None) => {
                iface.note(&result).await;
                if let Err(e) = result {
                    warn!(interface_id = iface.id(), error = %e, "value refresh failed");
                }
            }
        }
    });
}

// ── Command processor ────────────────────────────────────────────────

pub(crate) async fn command_processor_task(
    iface: Arc<Interface>,
    mut rx: mpsc::Receiver<CommandEnvelope>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            envelope = rx.recv() => {
                let Some(envelope) = envelope else { break };
                // Dropping the sender answers the caller with ShuttingDown.
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = route_command(&iface, envelope.command) => result,
                };
                iface.note(&result).await;
                let _ = envelope.response_tx.send(result);
            }
        }
    }
}

async fn route_command(iface: &Interface, command: Command) -> Result<(), CoreError> {
    let client = iface.client().await?;

    match command {
        Command::Write { writes } => {
            for write in writes {
                let at = Utc::now();
                client
                    .set_value(&write.channel_address, &write.parameter, &write.value)
                    .await?;
                debug!(
                    interface_id = iface.id(),
                    channel = %write.channel_address,
                    parameter = %write.parameter,
                    value = %write.value,
                    "value written"
                );
                iface.submit(Update::Value {
                    channel_address: write.channel_address,
                    parameter: write.parameter,
                    value: write.value,
                    source: ValueSource::Write,
                    at,
                })?;
            }
            Ok(())
        }
        Command::PutParamset {
            address,
            kind,
            values,
        } => {
            let at = Utc::now();
            client.put_paramset(&address, kind, &values).await?;
            debug!(
                interface_id = iface.id(),
                %address,
                %kind,
                count = values.len(),
                "paramset written"
            );
            if kind == ParamsetKind::Values {
                iface.submit(Update::Paramset {
                    address,
                    values,
                    source: ValueSource::Write,
                    at,
                })?;
            }
            Ok(())
        }
    }
}
