//! Per-socket driver task.
//!
//! A driver owns both halves of one socket. It reports lifecycle to the
//! actor tagged with its epoch and writes whatever the actor hands it.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::actor::{Signal, SocketEvent};
use crate::{
    error::{TransportError, TransportResult},
    socket::{CLOSE_ABNORMAL, CLOSE_NORMAL, Connector, SocketInput, SocketParts, SocketRequest},
    types::ConnectionId,
};

/// Instructions from the actor to one driver.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    /// Write a text frame.
    Send(String),
    /// Close the socket and stop.
    Close { code: u16, reason: String },
}

pub(crate) struct DriverContext {
    pub(crate) id: ConnectionId,
    pub(crate) epoch: u64,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) connect_timeout: Duration,
    pub(crate) signals: mpsc::UnboundedSender<Signal>,
}

impl DriverContext {
    fn report(&self, event: SocketEvent) {
        let _ = self.signals.send(Signal::Socket {
            id: self.id.clone(),
            epoch: self.epoch,
            event,
        });
    }

    fn report_failure(&self, err: &TransportError) {
        let reason = err.to_string();
        self.report(SocketEvent::Error(reason.clone()));
        self.report(SocketEvent::Closed {
            code: CLOSE_ABNORMAL,
            reason,
        });
    }
}

async fn dial(
    connector: Arc<dyn Connector>,
    request: TransportResult<SocketRequest>,
    connect_timeout: Duration,
) -> TransportResult<SocketParts> {
    let request = request?;
    tokio::time::timeout(connect_timeout, connector.connect(request))
        .await
        .map_err(|_| TransportError::timeout(connect_timeout))?
}

/// Run one socket from dial to close.
///
/// A `Close` from the actor ends the task silently: the actor has already
/// recorded the teardown and no longer listens to this epoch.
pub(crate) async fn run_socket(
    ctx: DriverContext,
    request: TransportResult<SocketRequest>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
) {
    let connect = dial(Arc::clone(&ctx.connector), request, ctx.connect_timeout);
    tokio::pin!(connect);

    let connected = loop {
        tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(SocketCommand::Close { .. }) | None => {
                    debug!(connection_id = %ctx.id, epoch = ctx.epoch, "Dial abandoned");
                    return;
                }
                Some(SocketCommand::Send(_)) => {
                    warn!(connection_id = %ctx.id, "Write before open dropped");
                }
            },
            result = &mut connect => break result,
        }
    };

    let SocketParts {
        mut writer,
        mut reader,
    } = match connected {
        Ok(parts) => parts,
        Err(err) => {
            warn!(connection_id = %ctx.id, epoch = ctx.epoch, error = %err, "WebSocket connect failed");
            ctx.report_failure(&err);
            return;
        }
    };

    ctx.report(SocketEvent::Open);

    loop {
        tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(SocketCommand::Send(text)) => {
                    if let Err(err) = writer.send_text(text).await {
                        warn!(connection_id = %ctx.id, error = %err, "WebSocket write failed");
                        ctx.report_failure(&err);
                        return;
                    }
                }
                Some(SocketCommand::Close { code, reason }) => {
                    if let Err(err) = writer.close(code, &reason).await {
                        debug!(connection_id = %ctx.id, error = %err, "Close frame not delivered");
                    }
                    return;
                }
                None => {
                    let _ = writer.close(CLOSE_NORMAL, "").await;
                    return;
                }
            },
            item = reader.next() => match item {
                Some(Ok(SocketInput::Message(inbound))) => {
                    ctx.report(SocketEvent::Message(inbound));
                }
                Some(Ok(SocketInput::Close { code, reason })) => {
                    ctx.report(SocketEvent::Closed { code, reason });
                    return;
                }
                Some(Err(err)) => {
                    warn!(connection_id = %ctx.id, error = %err, "WebSocket read error");
                    ctx.report_failure(&err);
                    return;
                }
                None => {
                    ctx.report(SocketEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "Connection lost".to_string(),
                    });
                    return;
                }
            },
        }
    }
}
