use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::store::CoordStore;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// GET /ws/trace/{trace_id}: upgrade and stream the trace's published
/// events until the client disconnects or the stream idles out. Origin is
/// not restricted here; deployments front this with their own policy.
pub async fn trace_stream(
    Path(trace_id): Path<String>,
    State(store): State<Arc<CoordStore>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, store, trace_id))
}

async fn stream_events(socket: WebSocket, store: Arc<CoordStore>, trace_id: String) {
    let channel = format!("trace:{}", trace_id);
    let (mut sender, mut receiver) = socket.split();

    // subscribe() resolves only once the server has acknowledged.
    let mut pubsub = match store.subscribe(&channel).await {
        Ok(pubsub) => pubsub,
        Err(err) => {
            tracing::warn!(error = %err, channel = %channel, "trace subscription failed");
            let _ = sender
                .send(Message::Text(
                    r#"{"error":"subscription failed"}"#.into(),
                ))
                .await;
            return;
        }
    };

    let subscribed = serde_json::json!({
        "type": "subscribed",
        "trace_id": trace_id,
        "channel": channel,
    });
    if sender
        .send(Message::Text(subscribed.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    let mut messages = pubsub.on_message();
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_INTERVAL,
        PING_INTERVAL,
    );
    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            msg = messages.next() => {
                let Some(msg) = msg else { return };
                let Ok(payload) = msg.get_payload::<String>() else { continue };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    return;
                }
                idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
            _ = &mut idle => {
                let _ = sender
                    .send(Message::Text(
                        r#"{"type":"timeout","message":"connection timed out"}"#.into(),
                    ))
                    .await;
                return;
            }
            // Client reads are drained only to detect close.
            inbound = receiver.next() => {
                match inbound {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
