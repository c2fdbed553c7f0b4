//! The long-lived event stream for remote observers.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};

use genqueue_events::sse::next_frame;

use crate::state::AppState;

/// GET /api/v1/events/stream
///
/// Opens one fan-out connection and writes `event:`/`data:` frames until
/// the client disconnects or the fan-out closes the connection. Idle
/// windows produce a `ping` frame. Dropping the body drops the connection,
/// which removes it from the fan-out.
pub async fn stream_events(State(state): State<AppState>) -> Response {
    let connection = state.fanout.new_connection();
    let keepalive = state.config.stream_keepalive();
    tracing::debug!(connection_id = %connection.id(), "Event stream opened");

    let frames = futures::stream::unfold(connection, move |mut connection| async move {
        match next_frame(&mut connection, keepalive).await {
            Some(frame) => Some((Ok::<_, Infallible>(frame.to_wire()), connection)),
            None => {
                tracing::debug!(connection_id = %connection.id(), "Event stream ended");
                None
            }
        }
    });

    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
            (CONNECTION, "keep-alive"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}
