use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::buffers::timestamp_now;
use crate::error::BridgeError;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Body of every bridge response.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Envelope {
    pub success: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: String,
}

impl Envelope {
    pub fn success(kind: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            kind: Some(kind.into()),
            data: Some(data),
            error: None,
            message: None,
            timestamp: timestamp_now(),
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            kind: None,
            data: None,
            error: Some(ErrorBody {
                kind: kind.into(),
                message: message.clone(),
            }),
            message: Some(message),
            timestamp: timestamp_now(),
        }
    }

    pub fn from_error(err: &BridgeError) -> Self {
        Self::failure(err.kind(), err.to_string())
    }
}
