//! Standard API response envelope.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};

/// JSON envelope shared with the HTTP API: `{"errCode", "errMsg", "errDlt", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub err_code: i32,
    pub err_msg: String,
    pub err_dlt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ApiResponse {
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self {
            err_code: 0,
            err_msg: String::new(),
            err_dlt: String::new(),
            data,
        }
    }

    /// Envelope describing `err`; the full error text goes into `errDlt`.
    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            err_code: err.code(),
            err_msg: err.message().to_string(),
            err_dlt: err.to_string(),
            data: None,
        }
    }
}
