use super::HttpResult;
use crate::app::AppState;
use crate::error::ApiError;
use crate::stream::Topic;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

/// GET /stream/{topic}. Each event carries one topic message, its `id` is
/// the message seq. A reconnecting client's `Last-Event-ID` skips what it
/// already applied.
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    headers: HeaderMap,
) -> HttpResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let topic: Topic = topic.parse().map_err(ApiError::InvalidRequest)?;
    if let Topic::QueryResult(job_id) = topic {
        state.jobs.get(job_id).await?;
    }

    let after_seq = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    debug!(topic = %topic, after_seq = after_seq, "Stream subscriber connected");
    let mut subscription = state.stream.subscribe(topic, after_seq);

    let stream = async_stream::stream! {
        while let Some(message) = subscription.next().await {
            match Event::default()
                .id(message.seq().to_string())
                .event(topic.to_string())
                .json_data(&message)
            {
                Ok(event) => yield Ok(event),
                Err(e) => warn!(topic = %topic, "Failed to encode stream message: {}", e),
            }
        }
        debug!(topic = %topic, "Stream topic closed");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
