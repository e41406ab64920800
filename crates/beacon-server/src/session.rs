//! Per-connection session loop.
//!
//! Each WebSocket connection gets one task running this loop. The session
//! owns the socket and the receiver half of its outbound channel; the
//! registry, router, and broadcasters only ever touch the cloneable handle.
//! Inbound frames are processed in arrival order, and every outbound frame
//! funnels through the single bounded channel, which preserves
//! per-connection ordering.

use crate::handlers::AppState;
use crate::metrics::{self, ConnectionMetricsGuard};
use axum::extract::ws::{Message, WebSocket};
use beacon_core::{ConnectionHandle, RelayOutcome, RouteError, SessionState};
use beacon_protocol::{codec, ClientFrame, ServerFrame, PROTOCOL_VERSION};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Whether the session loop should keep going after a frame.
enum Flow {
    Continue,
    Stop,
}

/// Drive one WebSocket connection from handshake to disconnect.
pub async fn run(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (mut sink, mut stream) = socket.split();
    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut lifecycle = SessionState::default();

    // Handshake: the first frame must be connect, within the timeout
    let connect = tokio::time::timeout(
        state.config.handshake_timeout(),
        next_frame(&mut stream, &mut read_buffer),
    )
    .await;

    let (version, credential) = match connect {
        Ok(Some(ClientFrame::Connect {
            version,
            credential,
        })) => (version, credential),
        Ok(Some(frame)) => {
            warn!(kind = frame.kind(), "First frame was not connect");
            metrics::record_error("handshake");
            let _ = send_frame(&mut sink, &ServerFrame::error("expected connect frame")).await;
            return;
        }
        Ok(None) => {
            debug!("Socket closed before handshake");
            return;
        }
        Err(_) => {
            debug!("Handshake timed out");
            metrics::record_error("handshake");
            let _ = send_frame(&mut sink, &ServerFrame::error("handshake timed out")).await;
            return;
        }
    };

    if let Err(e) = lifecycle.begin_authentication() {
        error!(error = %e, "Session state out of sync");
        return;
    }

    if version != PROTOCOL_VERSION {
        warn!(version, "Unsupported protocol version");
        metrics::record_error("version");
        let _ = send_frame(
            &mut sink,
            &ServerFrame::error("unsupported protocol version"),
        )
        .await;
        return;
    }

    let user_id = match state.validator.validate(&credential).await {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!(error = %e, "Authentication rejected");
            metrics::record_error("auth");
            if let Err(e) = lifecycle.mark_rejected() {
                error!(error = %e, "Session state out of sync");
            }
            // Do not leak why the credential was refused
            let _ = send_frame(&mut sink, &ServerFrame::error("authentication failed")).await;
            return;
        }
    };

    if state.registry.stats().connection_count >= state.config.limits.max_connections {
        warn!(user = %user_id, "Connection limit reached");
        metrics::record_error("capacity");
        let _ = send_frame(&mut sink, &ServerFrame::error("server at capacity")).await;
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel(state.config.limits.outbound_queue);
    let handle = ConnectionHandle::new(user_id.clone(), outbound_tx)
        .with_strike_limit(state.config.limits.delivery_strikes);

    if let Err(e) = lifecycle.mark_connected() {
        error!(error = %e, "Session state out of sync");
        return;
    }

    let registration = match state.registry.register(handle.clone()) {
        Ok(registration) => registration,
        Err(e) => {
            error!(error = %e, "Registration failed");
            metrics::record_error("registry");
            lifecycle.mark_disconnected();
            let _ = send_frame(&mut sink, &ServerFrame::error("internal error")).await;
            return;
        }
    };

    debug!(connection = %registration.connection_id, user = %user_id, "Session connected");

    // Announce only after the registration is visible through lookup
    if let Some(transition) = &registration.transition {
        metrics::record_presence_event(true);
        state.presence.announce(transition);
        metrics::set_users_online(state.registry.stats().user_count);
    }

    let connected = ServerFrame::connected(
        registration.connection_id.as_str(),
        PROTOCOL_VERSION,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sink, &connected).await.is_err() {
        finish(&state, &handle, &mut lifecycle);
        return;
    }

    let idle_timeout = state.config.heartbeat_timeout();
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            biased;

            // Outbound frames queued by the router and broadcasters
            maybe_frame = outbound_rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Force-closed by a slow-consumer strike or shutdown
            () = handle.closed() => {
                debug!(connection = %handle.id(), "Connection force-closed");
                break;
            }

            // Nothing heard from the peer for a full heartbeat timeout
            () = &mut idle => {
                debug!(connection = %handle.id(), "Idle past heartbeat timeout");
                metrics::record_error("idle");
                break;
            }

            // Inbound from the socket
            msg = stream.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        if let Flow::Stop = drain_frames(&mut read_buffer, &handle, &state) {
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());

                        if let Flow::Stop = drain_frames(&mut read_buffer, &handle, &state) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %handle.id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %handle.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %handle.id(), "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    finish(&state, &handle, &mut lifecycle);
}

/// Tear the session down. Safe against racing close causes: only the call
/// that wins the `Connected → Disconnected` transition unregisters.
fn finish(state: &AppState, handle: &ConnectionHandle, lifecycle: &mut SessionState) {
    if !lifecycle.mark_disconnected() {
        return;
    }

    handle.force_close();
    if let Some(transition) = state.registry.unregister(handle.id()) {
        state.typing.forget_recipient(transition.user_id());
        metrics::record_presence_event(false);
        state.presence.announce(&transition);
    }
    metrics::set_users_online(state.registry.stats().user_count);

    debug!(connection = %handle.id(), "Session disconnected");
}

/// Decode and process every complete frame in the read buffer.
fn drain_frames(buf: &mut BytesMut, handle: &ConnectionHandle, state: &AppState) -> Flow {
    loop {
        match codec::decode_from::<ClientFrame>(buf) {
            Ok(Some(frame)) => {
                if let Flow::Stop = handle_frame(frame, handle, state) {
                    return Flow::Stop;
                }
            }
            Ok(None) => return Flow::Continue,
            Err(e) => {
                warn!(connection = %handle.id(), error = %e, "Protocol error");
                metrics::record_error("protocol");
                let _ = handle.deliver(ServerFrame::error("malformed frame"));
                return Flow::Stop;
            }
        }
    }
}

/// Process one decoded frame from an established connection.
fn handle_frame(frame: ClientFrame, handle: &ConnectionHandle, state: &AppState) -> Flow {
    match frame {
        ClientFrame::MessageSend { to, content } => {
            let size = content.len();
            match state.router.route(handle, &to, &content) {
                Ok(receipt) => {
                    let direction = if receipt.delivered {
                        "delivered"
                    } else {
                        "undelivered"
                    };
                    metrics::record_message(size, direction);
                }
                Err(RouteError::RateLimited) => {
                    metrics::record_rate_limited();
                    let _ = handle.deliver(ServerFrame::rate_limited(
                        "message rate exceeded, slow down",
                    ));
                }
                Err(e) => {
                    metrics::record_error("validation");
                    let _ = handle.deliver(ServerFrame::error(e.to_string()));
                }
            }
        }

        ClientFrame::TypingStart { to } => relay_typing(handle, state, &to, true),
        ClientFrame::TypingStop { to } => relay_typing(handle, state, &to, false),

        ClientFrame::Ping { timestamp } => {
            handle.deliver_lossy(ServerFrame::Pong { timestamp });
        }

        ClientFrame::Connect { .. } => {
            debug!(connection = %handle.id(), "Connect frame on established connection, ignoring");
        }

        ClientFrame::Logout => {
            debug!(connection = %handle.id(), "Logout");
            return Flow::Stop;
        }
    }

    Flow::Continue
}

fn relay_typing(handle: &ConnectionHandle, state: &AppState, to: &str, is_typing: bool) {
    let outcome = state
        .typing
        .relay(handle.user_id(), &to.to_string(), is_typing);
    let label = match outcome {
        RelayOutcome::Delivered(_) => "relayed",
        RelayOutcome::Coalesced => "coalesced",
        RelayOutcome::RecipientOffline => "offline",
    };
    metrics::record_typing(label);
}

/// Read the next complete frame off the socket, buffering partial data.
///
/// Returns `None` when the socket closes or the peer violates the protocol.
async fn next_frame(stream: &mut SplitStream<WebSocket>, buf: &mut BytesMut) -> Option<ClientFrame> {
    loop {
        match codec::decode_from::<ClientFrame>(buf) {
            Ok(Some(frame)) => return Some(frame),
            Ok(None) => {}
            Err(_) => return None,
        }

        match stream.next().await? {
            Ok(Message::Binary(data)) => buf.extend_from_slice(&data),
            Ok(Message::Text(text)) => buf.extend_from_slice(text.as_bytes()),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => return None,
            Err(_) => return None,
        }
    }
}

/// Encode and send a frame on the socket.
async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> anyhow::Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sink.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
