use crate::identity::ClientIdentity;
use crate::server::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use okvm_agent::StreamEvent;
use okvm_session::ClientKey;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a client may send over the socket.
///
/// Plain text that is not one of these is treated as a chat message.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Chat {
        message: String,
        #[serde(default)]
        replace_last: bool,
    },
    Abort,
}

fn parse_inbound(text: &str) -> Inbound {
    if let Ok(inbound) = serde_json::from_str::<Inbound>(text) {
        return inbound;
    }
    #[derive(Deserialize)]
    struct Bare {
        message: String,
        #[serde(default)]
        replace_last: bool,
    }
    match serde_json::from_str::<Bare>(text) {
        Ok(bare) => Inbound::Chat {
            message: bare.message,
            replace_last: bare.replace_last,
        },
        Err(_) => Inbound::Chat {
            message: text.to_string(),
            replace_last: false,
        },
    }
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    identity: ClientIdentity,
) -> Response {
    let key = identity.key.clone();
    identity.respond(ws.on_upgrade(move |socket| handle_socket(socket, state, key)))
}

type Sender = SplitSink<WebSocket, Message>;

async fn send_line(sender: &mut Sender, line: String) -> bool {
    let text = line.trim_end_matches('\n').to_string();
    sender.send(Message::Text(text.into())).await.is_ok()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, key: ClientKey) {
    let (mut sender, mut receiver) = socket.split();
    info!(client_key = %key, "WebSocket connected");

    let welcome = serde_json::json!({ "type": "connected", "client_id": key.as_str() });
    if !send_line(&mut sender, welcome.to_string()).await {
        return;
    }

    while let Some(Ok(frame)) = receiver.next().await {
        let text = match frame {
            Message::Text(text) => text.as_str().to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let (message, replace_last) = match parse_inbound(&text) {
            Inbound::Chat { message, .. } if message.trim().is_empty() => {
                let event = StreamEvent::error("bad_request", "message must not be empty");
                if !send_line(&mut sender, event.to_line()).await {
                    break;
                }
                continue;
            }
            Inbound::Chat {
                message,
                replace_last,
            } => (message, replace_last),
            Inbound::Abort => {
                debug!(client_key = %key, "Abort with no turn in flight");
                continue;
            }
        };

        let mut stream = match state
            .sessions
            .start_turn_with(&key, message, replace_last)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let event = StreamEvent::error(e.kind(), e.to_string());
                if !send_line(&mut sender, event.to_line()).await {
                    break;
                }
                continue;
            }
        };

        // Forward the turn while still listening for aborts and disconnects.
        let mut connected = true;
        loop {
            tokio::select! {
                event = stream.next() => {
                    let Some(event) = event else { break };
                    if !send_line(&mut sender, event.to_line()).await {
                        connected = false;
                        break;
                    }
                }
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_inbound(text.as_str()) {
                        Inbound::Abort => {
                            info!(client_key = %key, "Turn aborted by client");
                            stream.cancel();
                        }
                        Inbound::Chat { .. } => {
                            let event = StreamEvent::error(
                                "turn_in_progress",
                                "a turn is already in progress for this client",
                            );
                            if !send_line(&mut sender, event.to_line()).await {
                                connected = false;
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        connected = false;
                        break;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
        if !connected {
            warn!(client_key = %key, "WebSocket closed during a turn");
            drop(stream);
            break;
        }
    }

    info!(client_key = %key, "WebSocket disconnected");
}
