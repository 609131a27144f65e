use crate::app_state::AppState;
use crate::handlers::require_session;
use crate::models::BusEvent;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{Message, MessageStream, Session};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};

/// Frames a client may send after the upgrade.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// No-op: the session was already established by the cookie.
    Authenticate {},
}

/// `GET /ws`: upgrade, then relay subscribed topics until either side goes
/// away. Auth happens before the upgrade; an unauthenticated request never
/// reaches the duplex phase.
pub async fn ws_entry(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let session = require_session(&req, &state).await?;
    let (response, ws_session, msg_stream) = actix_ws::handle(&req, stream)?;

    log::info!("ws_connected session_id={}", session.id);
    actix_web::rt::spawn(relay(ws_session, msg_stream, state.into_inner()));
    Ok(response)
}

async fn relay(
    mut session: Session,
    mut msg_stream: MessageStream,
    state: std::sync::Arc<AppState>,
) {
    // One live receiver per subscribed topic; a disconnect drops them all.
    let mut subs: StreamMap<String, ReceiverStream<BusEvent>> = StreamMap::new();

    loop {
        tokio::select! {
            msg = msg_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(&mut session, &mut subs, &state, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(bytes))) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
            // Backpressure is natural here: while this send awaits a slow
            // client, the per-topic queues fill and the bus emits lag events.
            Some((_topic, event)) = subs.next(), if !subs.is_empty() => {
                if send_event(&mut session, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = session.close(None).await;
}

async fn handle_frame(
    session: &mut Session,
    subs: &mut StreamMap<String, ReceiverStream<BusEvent>>,
    state: &AppState,
    text: &str,
) -> Result<(), actix_ws::Closed> {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Subscribe { topic }) => {
            if subs.contains_key(&topic) {
                return Ok(());
            }
            // Snapshot first, atomically with live channel registration, so
            // the client sees history strictly before live events.
            let (snapshot, rx) = state.bus.subscribe(&topic).await;
            subs.insert(topic.clone(), ReceiverStream::new(rx));
            for event in snapshot {
                send_event(session, &event).await?;
            }
            log::debug!("ws_subscribe topic={}", topic);
        }
        Ok(ClientFrame::Unsubscribe { topic }) => {
            subs.remove(&topic);
            log::debug!("ws_unsubscribe topic={}", topic);
        }
        Ok(ClientFrame::Authenticate {}) => {}
        Err(_) => {
            session
                .text(
                    json!({"type": "error", "message": "unknown frame"})
                        .to_string(),
                )
                .await?;
        }
    }
    Ok(())
}

async fn send_event(session: &mut Session, event: &BusEvent) -> Result<(), actix_ws::Closed> {
    match serde_json::to_string(event) {
        Ok(body) => session.text(body).await,
        Err(e) => {
            log::error!("ws_event_encode_failed error={}", e);
            Ok(())
        }
    }
}
