//! Step-progress relay over the ComfyUI WebSocket.
//!
//! [`watch`] opens `/ws?clientId=<id>` with the same client id used to
//! submit the prompt, then forwards `progress` frames for that prompt into
//! a channel until the prompt finishes, the socket closes, or the receiver
//! is dropped. Progress is advisory: frames are dropped rather than queued
//! without bound, and the caller keeps polling for the real status.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use genqueue_core::backend::ImageProgress;

use crate::messages::{parse_message, ComfyUIMessage};

/// Buffered progress updates per watched prompt.
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),
}

/// Start relaying progress for `prompt_id`.
///
/// The WebSocket handshake is bounded by `connect_timeout`.
pub async fn watch(
    ws_url: &str,
    client_id: &str,
    prompt_id: &str,
    connect_timeout: Duration,
) -> Result<mpsc::Receiver<ImageProgress>, ProgressError> {
    let url = format!("{ws_url}/ws?clientId={client_id}");
    let (mut ws_stream, _response) = tokio::time::timeout(connect_timeout, connect_async(&url))
        .await
        .map_err(|_| ProgressError::Timeout(connect_timeout))?
        .map_err(|e| {
            ProgressError::Connection(format!("Failed to connect to ComfyUI at {ws_url}: {e}"))
        })?;

    tracing::debug!(client_id, prompt_id, "Progress relay connected");

    let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
    let prompt_id = prompt_id.to_string();

    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = tx.closed() => break,
                frame = ws_stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => match parse_message(&text) {
                    Ok(message) => {
                        if relay(&tx, &prompt_id, &message) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(prompt_id = %prompt_id, error = %e, "Unparseable ComfyUI frame");
                    }
                },
                // Binary frames carry preview images.
                Some(Ok(Message::Binary(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(prompt_id = %prompt_id, ?frame, "ComfyUI WebSocket closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(prompt_id = %prompt_id, error = %e, "ComfyUI WebSocket receive error");
                    break;
                }
                None => break,
            }
        }
        let _ = ws_stream.close(None).await;
        tracing::debug!(prompt_id = %prompt_id, "Progress relay finished");
    });

    Ok(rx)
}

/// Forward `message` if it is progress for `prompt_id`. Returns `true`
/// once the prompt has finished.
fn relay(tx: &mpsc::Sender<ImageProgress>, prompt_id: &str, message: &ComfyUIMessage) -> bool {
    if let ComfyUIMessage::Progress(data) = message {
        let ours = data.prompt_id.as_deref().map_or(true, |id| id == prompt_id);
        if ours {
            let _ = tx.try_send(ImageProgress {
                value: data.value,
                max: data.max,
            });
        }
        return false;
    }
    message.finishes(prompt_id)
}
