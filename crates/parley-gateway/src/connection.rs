use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, trace};

use crate::handler::Gateway;
use crate::registry::GroupName;

/// Drive one WebSocket connection from accept to close.
///
/// The session joins `groups` immediately and stays unidentified until the
/// client sends `identify_user` or `receiver_connected`. Outgoing frames are
/// written by a dedicated task draining the session outbox in order.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, groups: Vec<GroupName>) {
    let (mut sender, mut receiver) = socket.split();
    let (mut session, mut outbox) = gateway.connect(groups).await;
    let session_id = session.id();

    info!(
        "Session {} connected to {}",
        session_id,
        session
            .groups()
            .iter()
            .map(GroupName::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => {
                trace!("Session {} writer closed", session_id);
                break;
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by axum; binary frames carry nothing here
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    send_task.abort();
    session.disconnect().await;
    info!("Session {} disconnected", session_id);
}
