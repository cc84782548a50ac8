//! WebSocket multiplexer
//!
//! One reader loop and one writer task per connection. The writer drains a
//! bounded outbound queue; when a slow client overflows it, the configured
//! policy either drops frames or closes the socket with code 1009 and the
//! client recovers by reconnecting with incremental replay. Protocol errors
//! reply on the same socket and keep the connection open.

use crate::registry::ClientState;
use crate::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{sink::SinkExt, stream::StreamExt};
use shelltender_core::{ShelltenderError, SinceReply};
use shelltender_types::{ClientMessage, DataSource, ServerMessage, SessionOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket close code for an overflowing outbound queue.
const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// Handle WebSocket upgrade on the configured path.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = format!("client-{}", Uuid::new_v4());
    info!("client {} connected", client_id);

    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.outbound_queue_limit);
    let overflowed = Arc::new(AtomicBool::new(false));
    let client_state = Arc::new(Mutex::new(ClientState::new()));
    state
        .registry
        .register(&client_id, tx, client_state.clone(), overflowed.clone());

    // Writer task: drains the bounded queue into the socket. When the
    // registry dropped us for overflow, finish with a 1009 close frame.
    let overflow_flag = overflowed.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        return;
                    }
                }
                Err(e) => error!("failed to serialize server message: {}", e),
            }
        }
        if overflow_flag.load(Ordering::SeqCst) {
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_MESSAGE_TOO_BIG,
                    reason: "outbound queue overflow".into(),
                })))
                .await;
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_text(&text, &client_id, &client_state, &state).await;
            }
            Ok(Message::Close(_)) => {
                debug!("client {} closed", client_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("client {} socket error: {}", client_id, e);
                break;
            }
        }
        if overflowed.load(Ordering::SeqCst) {
            break;
        }
    }

    // Cleanup: client-owned patterns, subscription sets, monitor/admin
    // membership, then the state itself.
    let owned_patterns = state.registry.unregister(&client_id);
    for pattern_id in owned_patterns {
        if let Some(session_id) = state.patterns.session_of(&pattern_id) {
            state.patterns.unregister(&pattern_id);
            let configs = state.patterns.patterns_for(&session_id);
            if let Err(e) = state.store.save_patterns(&session_id, &configs).await {
                warn!("failed to persist patterns for {}: {}", session_id, e);
            }
        }
    }
    let _ = writer.await;
    info!("client {} disconnected", client_id);
}

async fn handle_text(
    text: &str,
    client_id: &str,
    client_state: &Arc<Mutex<ClientState>>,
    state: &AppState,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            state.registry.send_to(
                client_id,
                error_frame(format!("invalid message: {e}"), None, None),
            );
            return;
        }
    };
    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string);
    let request_id = value
        .get("requestId")
        .and_then(|r| r.as_str())
        .map(str::to_string);

    match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => handle_message(message, client_id, client_state, state).await,
        Err(e) => {
            let data = match msg_type {
                Some(t) if e.to_string().contains("unknown variant") => {
                    format!("unknown message type: {t}")
                }
                _ => format!("invalid message: {e}"),
            };
            state
                .registry
                .send_to(client_id, error_frame(data, request_id, None));
        }
    }
}

async fn handle_message(
    message: ClientMessage,
    client_id: &str,
    client_state: &Arc<Mutex<ClientState>>,
    state: &AppState,
) {
    match message {
        ClientMessage::Create {
            options,
            cols,
            rows,
        } => {
            let mut opts = options.unwrap_or_default();
            if cols.is_some() {
                opts.cols = cols;
            }
            if rows.is_some() {
                opts.rows = rows;
            }
            handle_create(opts, client_id, client_state, state).await;
        }

        ClientMessage::Connect {
            session_id,
            use_incremental_updates,
            last_sequence,
        } => {
            if state.manager.get(&session_id).await.is_none() {
                state.registry.send_to(
                    client_id,
                    error_frame(
                        format!("session not found: {session_id}"),
                        None,
                        Some(session_id),
                    ),
                );
                return;
            }

            state.registry.subscribe(client_id, &session_id);
            let incremental = use_incremental_updates.unwrap_or(false);

            let reply = match (incremental, last_sequence) {
                (true, Some(cursor)) => match state.buffers.get_since(&session_id, cursor) {
                    SinceReply::UpToDate { last_seq } => ServerMessage::Connect {
                        session_id: session_id.clone(),
                        scrollback: None,
                        incremental_data: Some(String::new()),
                        from_sequence: Some(cursor),
                        last_sequence: last_seq,
                    },
                    SinceReply::Incremental { data, last_seq } => ServerMessage::Connect {
                        session_id: session_id.clone(),
                        scrollback: None,
                        incremental_data: Some(String::from_utf8_lossy(&data).into_owned()),
                        from_sequence: Some(cursor),
                        last_sequence: last_seq,
                    },
                    // Gap: fall back to a full scrollback reply but still
                    // advance the client's cursor to the head.
                    SinceReply::Gap { data, last_seq } => ServerMessage::Connect {
                        session_id: session_id.clone(),
                        scrollback: Some(String::from_utf8_lossy(&data).into_owned()),
                        incremental_data: None,
                        from_sequence: None,
                        last_sequence: last_seq,
                    },
                },
                _ => {
                    let snapshot = state.buffers.get_full(&session_id);
                    ServerMessage::Connect {
                        session_id: session_id.clone(),
                        scrollback: Some(String::from_utf8_lossy(&snapshot.data).into_owned()),
                        incremental_data: None,
                        from_sequence: None,
                        last_sequence: snapshot.last_seq,
                    }
                }
            };

            let last_sequence = match &reply {
                ServerMessage::Connect { last_sequence, .. } => *last_sequence,
                _ => unreachable!(),
            };
            {
                let mut cs = client_state.lock().unwrap();
                cs.is_incremental = incremental;
                cs.ready_sessions.insert(session_id.clone());
                cs.subscribed_sessions.insert(session_id.clone());
                cs.last_seq_per_session
                    .insert(session_id.clone(), last_sequence);
            }
            state.registry.send_to(client_id, reply);
        }

        ClientMessage::Input { session_id, data } => {
            let ready = client_state
                .lock()
                .unwrap()
                .ready_sessions
                .contains(&session_id);
            if !ready {
                // Writes are rejected until this client has received a
                // connect/created response for the session.
                state.registry.send_to(
                    client_id,
                    error_frame(
                        format!("session not connected: {session_id}"),
                        None,
                        Some(session_id),
                    ),
                );
                return;
            }
            match state
                .manager
                .write_input(&session_id, data.as_bytes(), DataSource::User)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    state.registry.send_to(
                        client_id,
                        error_frame(
                            format!("input rejected for session {session_id}"),
                            None,
                            Some(session_id),
                        ),
                    );
                }
                Err(e) => {
                    state
                        .registry
                        .send_to(client_id, error_frame(e.to_string(), None, Some(session_id)));
                }
            }
        }

        ClientMessage::Resize {
            session_id,
            cols,
            rows,
        } => match state.manager.resize(&session_id, cols, rows).await {
            Ok(()) => {
                state.registry.broadcast_to_session(
                    &session_id,
                    ServerMessage::Resize {
                        session_id: session_id.clone(),
                        cols,
                        rows,
                    },
                );
            }
            Err(e) => {
                state
                    .registry
                    .send_to(client_id, error_frame(e.to_string(), None, Some(session_id)));
            }
        },

        ClientMessage::Disconnect { session_id } => {
            state.registry.unsubscribe(client_id, &session_id);
            let mut cs = client_state.lock().unwrap();
            cs.subscribed_sessions.remove(&session_id);
            cs.ready_sessions.remove(&session_id);
            cs.last_seq_per_session.remove(&session_id);
        }

        ClientMessage::RegisterPattern {
            session_id,
            config,
            request_id,
        } => {
            if !state.manager.exists(&session_id).await {
                state.registry.send_to(
                    client_id,
                    error_frame(
                        format!("session not found: {session_id}"),
                        request_id,
                        Some(session_id),
                    ),
                );
                return;
            }
            match state.patterns.register(&session_id, config) {
                Ok(pattern_id) => {
                    state.registry.own_pattern(&pattern_id, client_id);
                    client_state
                        .lock()
                        .unwrap()
                        .registered_patterns
                        .insert(pattern_id.clone());
                    state.registry.send_to(
                        client_id,
                        ServerMessage::PatternRegistered {
                            pattern_id,
                            request_id,
                        },
                    );
                    let configs = state.patterns.patterns_for(&session_id);
                    if let Err(e) = state.store.save_patterns(&session_id, &configs).await {
                        warn!("failed to persist patterns for {}: {}", session_id, e);
                    }
                }
                Err(e) => {
                    state.registry.send_to(
                        client_id,
                        error_frame(e.to_string(), request_id, Some(session_id)),
                    );
                }
            }
        }

        ClientMessage::UnregisterPattern {
            pattern_id,
            request_id,
        } => {
            match state.registry.pattern_owner(&pattern_id) {
                Some(owner) if owner != client_id => {
                    state.registry.send_to(
                        client_id,
                        error_frame(
                            format!("pattern {pattern_id} is owned by another client"),
                            request_id,
                            None,
                        ),
                    );
                    return;
                }
                _ => {}
            }
            let session_id = state.patterns.session_of(&pattern_id);
            state.patterns.unregister(&pattern_id);
            state.registry.release_pattern(&pattern_id);
            client_state
                .lock()
                .unwrap()
                .registered_patterns
                .remove(&pattern_id);
            state.registry.send_to(
                client_id,
                ServerMessage::PatternUnregistered {
                    pattern_id,
                    request_id,
                },
            );
            if let Some(session_id) = session_id {
                let configs = state.patterns.patterns_for(&session_id);
                if let Err(e) = state.store.save_patterns(&session_id, &configs).await {
                    warn!("failed to persist patterns for {}: {}", session_id, e);
                }
            }
        }

        ClientMessage::SubscribeEvents { event_types } => {
            let current = {
                let mut cs = client_state.lock().unwrap();
                cs.event_subscriptions.extend(event_types);
                let mut list: Vec<String> = cs.event_subscriptions.iter().cloned().collect();
                list.sort();
                list
            };
            state.registry.send_to(
                client_id,
                ServerMessage::Subscribed {
                    event_types: current,
                },
            );
        }

        ClientMessage::UnsubscribeEvents { event_types } => {
            let current = {
                let mut cs = client_state.lock().unwrap();
                for event_type in &event_types {
                    cs.event_subscriptions.remove(event_type);
                }
                let mut list: Vec<String> = cs.event_subscriptions.iter().cloned().collect();
                list.sort();
                list
            };
            state.registry.send_to(
                client_id,
                ServerMessage::Unsubscribed {
                    event_types: current,
                },
            );
        }

        ClientMessage::MonitorAll { auth_key } => {
            let authorized = state
                .config
                .monitor_auth_key
                .as_deref()
                .map(|expected| expected == auth_key)
                .unwrap_or(false);
            if !authorized {
                state.registry.send_to(
                    client_id,
                    error_frame(
                        ShelltenderError::AuthFailed.to_string(),
                        None,
                        None,
                    ),
                );
                return;
            }
            state.registry.set_monitor(client_id);
            client_state.lock().unwrap().is_monitor = true;
            state
                .registry
                .send_to(client_id, ServerMessage::MonitorModeEnabled);
            info!("client {} enabled monitor mode", client_id);
        }

        ClientMessage::AdminList => {
            if !admin_allowed(client_state, state) {
                state
                    .registry
                    .send_to(client_id, error_frame("admin access denied".into(), None, None));
                return;
            }
            let sessions = state.manager.get_all().await;
            state
                .registry
                .send_to(client_id, ServerMessage::AdminSessions { sessions });
        }

        ClientMessage::AdminAttach { session_id } => {
            if !admin_allowed(client_state, state) {
                state
                    .registry
                    .send_to(client_id, error_frame("admin access denied".into(), None, Some(session_id)));
                return;
            }
            match state.admin_proxy.attach(client_id, &session_id).await {
                Ok(buffer) => {
                    {
                        let mut cs = client_state.lock().unwrap();
                        cs.admin_sessions.insert(session_id.clone());
                        cs.subscribed_sessions.insert(session_id.clone());
                    }
                    state.registry.send_to(
                        client_id,
                        ServerMessage::AdminAttached { session_id, buffer },
                    );
                }
                Err(e) => {
                    state
                        .registry
                        .send_to(client_id, error_frame(e.to_string(), None, Some(session_id)));
                }
            }
        }

        ClientMessage::AdminDetach { session_id } => {
            if !admin_allowed(client_state, state) {
                state
                    .registry
                    .send_to(client_id, error_frame("admin access denied".into(), None, Some(session_id)));
                return;
            }
            state.admin_proxy.detach(client_id, &session_id);
            {
                let mut cs = client_state.lock().unwrap();
                cs.admin_sessions.remove(&session_id);
                cs.subscribed_sessions.remove(&session_id);
            }
            state
                .registry
                .send_to(client_id, ServerMessage::AdminDetached { session_id });
        }

        ClientMessage::AdminInput { session_id, data } => {
            if !admin_allowed(client_state, state) {
                state
                    .registry
                    .send_to(client_id, error_frame("admin access denied".into(), None, Some(session_id)));
                return;
            }
            match state.admin_proxy.input(&session_id, data.as_bytes()).await {
                Ok(true) => {}
                Ok(false) => {
                    state.registry.send_to(
                        client_id,
                        error_frame(
                            format!("input rejected for session {session_id}"),
                            None,
                            Some(session_id),
                        ),
                    );
                }
                Err(e) => {
                    state
                        .registry
                        .send_to(client_id, error_frame(e.to_string(), None, Some(session_id)));
                }
            }
        }
    }
}

async fn handle_create(
    opts: SessionOptions,
    client_id: &str,
    client_state: &Arc<Mutex<ClientState>>,
    state: &AppState,
) {
    // Reattach instead of erroring when the id is already live.
    if let Some(id) = opts.id.clone() {
        if let Some(session) = state.manager.get(&id).await {
            attach_created(client_id, client_state, state, session);
            return;
        }
    }

    match state.manager.create(opts).await {
        Ok(session) => attach_created(client_id, client_state, state, session),
        Err(ShelltenderError::SessionAlreadyExists(id)) => {
            // Lost the race with another creator; attach to the winner.
            match state.manager.get(&id).await {
                Some(session) => attach_created(client_id, client_state, state, session),
                None => {
                    state
                        .registry
                        .send_to(client_id, error_frame(format!("session not found: {id}"), None, Some(id)));
                }
            }
        }
        Err(e) => {
            state
                .registry
                .send_to(client_id, error_frame(e.to_string(), None, None));
        }
    }
}

fn attach_created(
    client_id: &str,
    client_state: &Arc<Mutex<ClientState>>,
    state: &AppState,
    session: shelltender_types::Session,
) {
    let session_id = session.id.clone();
    state.registry.subscribe(client_id, &session_id);
    {
        let mut cs = client_state.lock().unwrap();
        cs.subscribed_sessions.insert(session_id.clone());
        cs.ready_sessions.insert(session_id.clone());
    }
    state.registry.send_to(
        client_id,
        ServerMessage::Created {
            session_id,
            session,
        },
    );
}

/// Admin messages require monitor mode when a monitor key is configured;
/// with no key configured the deployment is development-grade and the
/// admin surface stays open.
fn admin_allowed(client_state: &Arc<Mutex<ClientState>>, state: &AppState) -> bool {
    state.config.monitor_auth_key.is_none() || client_state.lock().unwrap().is_monitor
}

fn error_frame(
    data: String,
    request_id: Option<String>,
    session_id: Option<String>,
) -> ServerMessage {
    ServerMessage::Error {
        data,
        request_id,
        session_id,
    }
}
