use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{LipSyncError, Result};

/// Kinds of work an endpoint understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobType {
    Initialize,
    GenerateMotion,
    ConvertMotion,
    SynthesizeSpeech,
}

/// Outbound message. Binary payloads travel beside the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub request_id: String,
    /// Logical endpoint the message is meant for. `None` goes to the bus's
    /// default endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(skip)]
    pub attachments: Vec<Bytes>,
}

impl DispatchRequest {
    pub fn new(job_type: JobType, data: Value) -> Self {
        Self {
            job_type,
            request_id: uuid::Uuid::new_v4().to_string(),
            target: None,
            data,
            attachments: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: Option<String>) -> Self {
        self.target = target;
        self
    }

    pub fn with_attachment(mut self, payload: Bytes) -> Self {
        self.attachments.push(payload);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Reply correlated with a [`DispatchRequest`] by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    #[serde(rename = "type")]
    pub status: ResponseStatus,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub attachments: Vec<Bytes>,
}

impl DispatchResponse {
    pub fn success(request_id: impl Into<String>, data: Value, attachments: Vec<Bytes>) -> Self {
        Self {
            status: ResponseStatus::Success,
            request_id: request_id.into(),
            data: Some(data),
            error: None,
            attachments,
        }
    }

    pub fn error(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            request_id: request_id.into(),
            data: None,
            error: Some(error.into()),
            attachments: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Turns an error envelope into [`LipSyncError::Dispatch`].
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            ResponseStatus::Success => Ok(self),
            ResponseStatus::Error => Err(LipSyncError::Dispatch(
                self.error
                    .unwrap_or_else(|| "endpoint reported an unspecified error".to_string()),
            )),
        }
    }
}
