//! Adapts a caller's [`DeliveryStream`] into Server-Sent Events.

use crate::server::{
    service::models::GenerateResponse,
    telemetry::{
        decrement_streams_inflight, increment_fragments_delivered, increment_stream_errors,
        increment_streams_inflight, record_stream_duration,
    },
};
use axum::response::sse::Event;
use core::convert::Infallible;
use fanout::{Delivery, DeliveryStream};
use futures::{Stream, StreamExt};
use std::time::Instant;

/// Tracks one open response stream. Dropping it, whether the stream finished
/// or the client went away, closes the in-flight gauge.
struct StreamGuard {
    start: Instant,
}

impl StreamGuard {
    fn new() -> Self {
        increment_streams_inflight();
        Self {
            start: Instant::now(),
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        decrement_streams_inflight();
        record_stream_duration(self.start.elapsed().as_millis() as f64);
    }
}

/// Converts every delivery into a JSON `data:` event. The stream ends after
/// the terminal event; dropping it early cancels the request.
pub fn sse_events(stream: DeliveryStream) -> impl Stream<Item = Result<Event, Infallible>> {
    let request_id = stream.request_id();
    let guard = StreamGuard::new();

    stream.map(move |delivery| {
        let _guard = &guard;
        match &delivery {
            Delivery::Text(_) => increment_fragments_delivered(),
            Delivery::Completed => {}
            Delivery::Failed(_e) => {
                increment_stream_errors();
                #[cfg(feature = "tracing")]
                tracing::debug!("Request {request_id} failed: {_e}");
            }
        }

        let payload = GenerateResponse::from_delivery(request_id, delivery);
        Ok(Event::default()
            .json_data(&payload)
            .unwrap_or_else(|_e| Event::default().comment("unserializable event")))
    })
}
