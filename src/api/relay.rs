//! WebSocket relay for quote requests
//!
//! Clients send JSON frames tagged by `type`:
//! - `quote_request` is answered with `quote_response` or `error`
//! - `heartbeat` is answered with `heartbeat_ack`

use super::AppState;
use crate::pricing::{Quote, QuoteEngine, QuoteRequest};
use crate::types::now_secs;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayRequest {
    QuoteRequest {
        #[serde(default)]
        request_id: Option<String>,
        request: QuoteRequest,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<u64>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayResponse {
    QuoteResponse {
        request_id: Option<String>,
        quote: Quote,
    },
    HeartbeatAck {
        /// Echo of the client timestamp
        timestamp: Option<u64>,
        server_time: u64,
    },
    Error {
        request_id: Option<String>,
        message: String,
    },
}

pub async fn relay_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    debug!("Relay connection {} opened", connection_id);

    let (mut sender, mut receiver) = socket.split();

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("Relay connection {} error: {}", connection_id, e);
                break;
            }
        };

        let response = handle_message(&state.quotes, &text);
        let payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode relay response: {}", e);
                continue;
            }
        };
        if sender.send(Message::Text(payload)).await.is_err() {
            break;
        }
    }

    debug!("Relay connection {} closed", connection_id);
}

/// Answer one relay frame
pub fn handle_message(quotes: &QuoteEngine, text: &str) -> RelayResponse {
    let request = match serde_json::from_str::<RelayRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            return RelayResponse::Error {
                request_id: None,
                message: format!("Invalid message: {}", e),
            }
        }
    };

    match request {
        RelayRequest::QuoteRequest {
            request_id,
            request,
        } => match quotes.quote(&request, now_secs()) {
            Ok(quote) => RelayResponse::QuoteResponse { request_id, quote },
            Err(e) => RelayResponse::Error {
                request_id,
                message: e.to_string(),
            },
        },
        RelayRequest::Heartbeat { timestamp } => RelayResponse::HeartbeatAck {
            timestamp,
            server_time: now_secs(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use serde_json::{json, Value};

    fn engine() -> QuoteEngine {
        QuoteEngine::new(&sample_settings().pricing).unwrap()
    }

    fn respond(frame: Value) -> Value {
        serde_json::to_value(handle_message(&engine(), &frame.to_string())).unwrap()
    }

    #[test]
    fn test_quote_request() {
        let response = respond(json!({
            "type": "quote_request",
            "request_id": "r-1",
            "request": {
                "src_chain_id": 1,
                "dst_chain_id": 137,
                "src_token": "0x1111111111111111111111111111111111111111",
                "dst_token": "0x2222222222222222222222222222222222222222",
                "src_amount": "1000000000000000000"
            }
        }));

        assert_eq!(response["type"], "quote_response");
        assert_eq!(response["request_id"], "r-1");
        assert_eq!(response["quote"]["dst_amount"], "1994000000");
    }

    #[test]
    fn test_quote_error_keeps_request_id() {
        let response = respond(json!({
            "type": "quote_request",
            "request_id": "r-2",
            "request": {
                "src_chain_id": 1,
                "dst_chain_id": 137,
                "src_token": "0x3333333333333333333333333333333333333333",
                "dst_token": "0x2222222222222222222222222222222222222222",
                "src_amount": "1"
            }
        }));

        assert_eq!(response["type"], "error");
        assert_eq!(response["request_id"], "r-2");
        assert!(response["message"].as_str().unwrap().contains("Unsupported token"));
    }

    #[test]
    fn test_heartbeat() {
        let response = respond(json!({ "type": "heartbeat", "timestamp": 42 }));
        assert_eq!(response["type"], "heartbeat_ack");
        assert_eq!(response["timestamp"], 42);
        assert!(response["server_time"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_malformed_frame() {
        let response = serde_json::to_value(handle_message(&engine(), "not json")).unwrap();
        assert_eq!(response["type"], "error");
        assert!(response["request_id"].is_null());
    }
}
