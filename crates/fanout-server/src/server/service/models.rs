//! JSON payloads of the HTTP API.

use fanout::{Delivery, RequestId};
use serde::{Deserialize, Serialize};

/// Body of `POST /generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
}

/// Progress of a request as reported in each SSE event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    InProgress,
    Completed,
    Failed,
}

/// One SSE event. `text` carries only the newly generated delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub request_id: String,
    pub text: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl GenerateResponse {
    pub fn from_delivery(request_id: RequestId, delivery: Delivery) -> Self {
        let request_id = request_id.to_string();
        match delivery {
            Delivery::Text(text) => Self {
                request_id,
                text,
                status: ResponseStatus::InProgress,
                error: None,
            },
            Delivery::Completed => Self {
                request_id,
                text: String::new(),
                status: ResponseStatus::Completed,
                error: None,
            },
            Delivery::Failed(e) => Self {
                request_id,
                text: String::new(),
                status: ResponseStatus::Failed,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout::Error;

    #[test]
    fn status_serializes_in_snake_case() {
        let json = serde_json::to_string(&ResponseStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn failures_carry_the_error_message() {
        let id = RequestId::new();
        let event = GenerateResponse::from_delivery(id, Delivery::Failed(Error::ServiceShutdown));
        assert_eq!(event.status, ResponseStatus::Failed);
        assert_eq!(event.error.as_deref(), Some("Service is shutting down"));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["request_id"], id.to_string());
        assert_eq!(value["status"], "failed");
    }

    #[test]
    fn text_events_carry_a_null_error() {
        let event = GenerateResponse::from_delivery(RequestId::new(), Delivery::Text("hi".into()));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["text"], "hi");
        assert!(value["error"].is_null());
    }
}
