//! The in-game WebSocket channel.
//!
//! After the upgrade, the socket is attached to the player's seat in the
//! game the session was matched into. Outbound traffic flows through an
//! unbounded channel owned by the seat, so game-side broadcasts never touch
//! the socket directly; a writer task forwards frames and interleaves the
//! server heartbeat. When the last sender for the channel is dropped (the
//! game ended or the seat was cleared) the writer sends a close frame.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::http::cookie;
use super::App;
use crate::game::{ClientMessage, ServerMessage, SharedGame};
use crate::validate;

/// Frames larger than this are rejected outright.
const MAX_FRAME_BYTES: usize = 10_000;

pub async fn upgrade(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = cookie(&headers, "session_id");
    ws.on_upgrade(move |socket| handle_socket(app, session_id, socket))
}

/// Send one frame on a raw socket and close it. Used for pre-attach
/// failures where no writer task exists yet.
async fn reject(mut socket: WebSocket, message: &str) {
    if let Some(text) = ServerMessage::error(message).encode() {
        let _ = socket.send(Message::Text(text.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn handle_socket(app: Arc<App>, session_id: Option<String>, socket: WebSocket) {
    // Authenticate the upgrade.
    let Some(session_id) = session_id else {
        return reject(socket, "Not authenticated").await;
    };
    if !validate::valid_input(&session_id) || !validate::valid_length(&session_id, 1, 128) {
        return reject(socket, "Invalid session").await;
    }
    let Some(session) = app.sessions.get(&session_id) else {
        return reject(socket, "Invalid session").await;
    };

    // Find the game this session was matched into.
    let Some(game) = app.registry.game_for_session(&session_id) else {
        return reject(socket, "No active game found. Please start matchmaking.").await;
    };

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // Attach to the seat and announce the game.
    {
        let mut g = game.lock().await;
        let Some(seat) = g.seat_of_session(&session_id) else {
            drop(g);
            let _ = sink.send(Message::Close(None)).await;
            return;
        };
        g.players[seat].outbound = Some(out_tx.clone());

        let me = &g.players[seat];
        let opponent = &g.players[1 - seat];
        let start = ServerMessage::GameStart {
            game_id: g.game_id.clone(),
            your_color: me.color,
            your_username: me.username.clone(),
            opponent_username: opponent.username.clone(),
            fen: g.fen.clone(),
            legal_moves: g.legal_moves.clone(),
            current_turn: g.current_turn,
        };
        if let Some(text) = start.encode() {
            let _ = out_tx.send(text);
        }
        debug!(game = %g.game_id, username = %session.username, "WebSocket attached");
    }
    // Keep one clone purely as this connection's identity for teardown;
    // the seat holds the sender the game broadcasts through.
    let conn_tx = out_tx.clone();
    drop(out_tx);

    let heartbeat = Duration::from_secs(app.config.game.heartbeat_secs.max(1));
    let mut writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.reset();
        loop {
            tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let Some(ping) = ServerMessage::Ping.encode() else {
                        continue;
                    };
                    if sink.send(Message::Text(ping.into())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Read loop; every arm makes progress toward shutdown.
    let mut shutdown = app.state.subscribe();
    loop {
        let frame = tokio::select! {
            _ = shutdown.wait_for(|v| *v) => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                dispatch(&app, &game, &session_id, text.as_str()).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Binary(_))) => {
                send_error(&game, &session_id, "Invalid message format").await;
            }
            // Protocol pings are answered by the websocket layer.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    // Clearing the seat (and the identity clone) drops the channel's last
    // senders, which lets the writer flush its close frame and exit.
    app.registry.disconnect(&game, &session_id, &conn_tx).await;
    drop(conn_tx);
    if tokio::time::timeout(Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

async fn send_error(game: &SharedGame, session_id: &str, message: &str) {
    let g = game.lock().await;
    if let Some(seat) = g.seat_of_session(session_id) {
        g.send_to(seat, &ServerMessage::error(message));
    }
}

async fn dispatch(app: &App, game: &SharedGame, session_id: &str, text: &str) {
    if text.len() > MAX_FRAME_BYTES {
        return send_error(game, session_id, "Message too large").await;
    }

    // Frames are authenticated requests; keep the session warm while the
    // player is at the board.
    if app.sessions.get(session_id).is_none() {
        return send_error(game, session_id, "Invalid session").await;
    }
    app.sessions.touch(session_id);

    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => return send_error(game, session_id, "Invalid message format").await,
    };

    match message {
        ClientMessage::Handshake => {
            let g = game.lock().await;
            if let Some(seat) = g.seat_of_session(session_id) {
                g.send_to(
                    seat,
                    &ServerMessage::HandshakeAck {
                        message: "Server ready".into(),
                    },
                );
            }
        }
        ClientMessage::Move { mv, from, to } => {
            let Some(mv) = ClientMessage::move_string(mv, from, to) else {
                return send_error(game, session_id, "Invalid move format").await;
            };
            if !validate::valid_length(&mv, 1, 20) || !validate::valid_input(&mv) {
                return send_error(game, session_id, "Invalid move format").await;
            }
            app.registry
                .handle_move(game, session_id, &mv, &app.engine, &app.users)
                .await;
        }
        ClientMessage::Resign => {
            app.registry.resign(game, session_id, &app.users).await;
        }
        ClientMessage::OfferDraw => {
            app.registry.offer_draw(game, session_id).await;
        }
        ClientMessage::AcceptDraw => {
            app.registry.accept_draw(game, &app.users).await;
        }
        ClientMessage::DeclineDraw => {
            app.registry.decline_draw(game, session_id).await;
        }
        ClientMessage::CancelDrawOffer => {
            app.registry.cancel_draw_offer(game, session_id).await;
        }
        ClientMessage::Pong => {}
        ClientMessage::Unknown => {
            warn!("Unknown WebSocket message type");
        }
    }
}
