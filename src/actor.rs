//! Actor-based engine driver: owns one `KcpEngine` in a dedicated task and
//! talks to it over channels. Zero locks on the hot path.
//!
//! The engine has no clock of its own; the actor feeds it milliseconds since
//! the task started and sleeps until the time `KcpEngine::check` names.

use crate::error::{ConnectionError, KcpError, Result};
use crate::metrics::global_metrics;
use crate::transport::Transport;

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use ukcp_core::{time_diff, KcpEngine, KcpStats, Timestamp};

/// Commands sent to the engine actor.
pub(crate) enum EngineCmd {
    Send {
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<KcpStats>,
    },
    IsAlive {
        reply: oneshot::Sender<bool>,
    },
    Close,
}

/// Clonable, lock-free handle to the engine actor.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCmd>,
}

impl EngineHandle {
    pub fn new(cmd_tx: mpsc::Sender<EngineCmd>) -> Self {
        Self { cmd_tx }
    }

    /// Send a command and wait for the reply. Returns a connection-closed error
    /// if the actor has exited.
    async fn request<T>(&self, cmd: impl FnOnce(oneshot::Sender<T>) -> EngineCmd) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(cmd(reply))
            .await
            .map_err(|_| KcpError::connection(ConnectionError::Closed))?;
        rx.await
            .map_err(|_| KcpError::connection(ConnectionError::Closed))
    }

    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.request(|reply| EngineCmd::Send { data, reply }).await?
    }

    pub async fn flush(&self) -> Result<()> {
        self.request(|reply| EngineCmd::Flush { reply }).await
    }

    pub async fn stats(&self) -> Result<KcpStats> {
        self.request(|reply| EngineCmd::Stats { reply }).await
    }

    pub async fn is_alive(&self) -> bool {
        self.request(|reply| EngineCmd::IsAlive { reply })
            .await
            .unwrap_or(false)
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(EngineCmd::Close);
    }
}

/// Runtime knobs the actor reads from `KcpConfig`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorSettings {
    pub keep_alive: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

/// Why an actor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitReason {
    Closed,
    DeadLink,
    IdleTimeout,
    InputClosed,
}

/// Milliseconds since `epoch` on the engine's wrapping 32-bit clock.
fn clock(epoch: Instant) -> Timestamp {
    epoch.elapsed().as_millis() as Timestamp
}

/// Run the engine actor loop.
///
/// - `input_rx`: raw datagrams routed to this conversation by the endpoint.
/// - `data_tx`: assembled application messages forwarded to the session.
pub(crate) async fn run_engine_actor<T: Transport>(
    mut engine: KcpEngine,
    mut cmd_rx: mpsc::Receiver<EngineCmd>,
    mut input_rx: mpsc::Receiver<Bytes>,
    data_tx: mpsc::Sender<Bytes>,
    transport: Arc<T>,
    peer_addr: T::Addr,
    settings: ActorSettings,
) -> ExitReason {
    let conv = engine.conv();
    let epoch = Instant::now();
    let mut last_probe: Timestamp = 0;

    // Establish the flush baseline and push out anything queued before spawn
    engine.update(clock(epoch));
    flush_output(&mut engine, &transport, &peer_addr).await;

    let reason = loop {
        let now = clock(epoch);
        let due = engine.check(now);
        let wait = Duration::from_millis(time_diff(due, now).max(0) as u64);

        tokio::select! {
            biased;

            // Update clock (prioritized to avoid timer starvation)
            _ = tokio::time::sleep(wait) => {
                let now = clock(epoch);
                engine.update(now);

                let idle = Duration::from_millis(engine.idle_ms(now) as u64);
                if settings.idle_timeout.is_some_and(|limit| idle >= limit) {
                    warn!(conv = %conv, idle_ms = idle.as_millis() as u64, "Conversation idle timeout");
                    break ExitReason::IdleTimeout;
                }

                if let Some(keep_alive) = settings.keep_alive {
                    let since_probe = Duration::from_millis(time_diff(now, last_probe).max(0) as u64);
                    if idle >= keep_alive && since_probe >= keep_alive {
                        trace!(conv = %conv, "Keep-alive probe");
                        engine.keep_alive_probe();
                        engine.flush();
                        last_probe = now;
                    }
                }

                flush_output(&mut engine, &transport, &peer_addr).await;

                if engine.is_dead() {
                    break ExitReason::DeadLink;
                }
                drain_recv(&mut engine, &data_tx);
            }

            // User commands
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(EngineCmd::Send { data, reply }) => {
                        let r = if engine.is_dead() {
                            Err(KcpError::connection(ConnectionError::Lost))
                        } else {
                            engine.send(&data).map_err(KcpError::from)
                        };
                        if r.is_ok() {
                            engine.flush();
                            flush_output(&mut engine, &transport, &peer_addr).await;
                        }
                        let _ = reply.send(r);
                    }
                    Some(EngineCmd::Flush { reply }) => {
                        engine.flush();
                        flush_output(&mut engine, &transport, &peer_addr).await;
                        let _ = reply.send(());
                    }
                    Some(EngineCmd::Stats { reply }) => {
                        let _ = reply.send(*engine.stats());
                    }
                    Some(EngineCmd::IsAlive { reply }) => {
                        let _ = reply.send(!engine.is_dead());
                    }
                    Some(EngineCmd::Close) | None => {
                        // Graceful shutdown: flush pending acks and data once more
                        engine.flush();
                        flush_output(&mut engine, &transport, &peer_addr).await;
                        break ExitReason::Closed;
                    }
                }
            }

            // Incoming network packets
            packet = input_rx.recv() => {
                match packet {
                    Some(data) => {
                        engine.update(clock(epoch));
                        match engine.input(&data) {
                            Ok(()) => global_metrics().datagram_received(),
                            Err(e) => {
                                global_metrics().datagram_dropped();
                                debug!(conv = %conv, error = %e, "Datagram rejected");
                            }
                        }
                        flush_output(&mut engine, &transport, &peer_addr).await;
                        drain_recv(&mut engine, &data_tx);
                    }
                    None => {
                        // Input channel closed: the endpoint is gone
                        trace!(conv = %conv, "Input channel closed, stopping actor");
                        break ExitReason::InputClosed;
                    }
                }
            }
        }
    };

    let stats = *engine.stats();
    global_metrics().conversation_closed(&stats);
    engine.release();

    info!(conv = %conv, peer = %peer_addr, reason = ?reason, "Conversation closed");
    reason
}

/// Send all buffered output datagrams over the transport.
async fn flush_output<T: Transport>(engine: &mut KcpEngine, transport: &Arc<T>, peer: &T::Addr) {
    for buf in engine.drain_output() {
        match transport.send_to(&buf, peer).await {
            Ok(_) => global_metrics().datagram_sent(),
            Err(e) => trace!(error = %e, "Transport send_to failed"),
        }
    }
}

/// Forward complete messages to the session while its channel has room.
/// Messages that do not fit stay in the engine and shrink the advertised window.
fn drain_recv(engine: &mut KcpEngine, data_tx: &mpsc::Sender<Bytes>) {
    while data_tx.capacity() > 0 {
        let Ok(msg) = engine.recv_bytes() else {
            break;
        };
        if data_tx.try_send(msg).is_err() {
            break; // Channel closed
        }
    }
}
