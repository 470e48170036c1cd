//! Gateway-originated JSON error envelope.
//!
//! Errors produced by the gateway itself (as opposed to upstream engine
//! errors, which pass through untouched) share one wire shape:
//!
//! ```json
//! {"error": {"code": 404, "type": "not_found", "message": "..."}, "trace_id": "..."}
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A well-known gateway error class: HTTP code plus stable `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrCode {
    pub code: u16,
    pub kind: &'static str,
    pub msg: &'static str,
}

pub const ERR_BAD_REQUEST: ErrCode = ErrCode {
    code: 400,
    kind: "bad_request",
    msg: "Bad Request",
};

pub const ERR_NOT_FOUND: ErrCode = ErrCode {
    code: 404,
    kind: "not_found",
    msg: "Not Found",
};

pub const ERR_INFERENCE_SERVER: ErrCode = ErrCode {
    code: 503,
    kind: "inference_server_error",
    msg: "Inference Server Error",
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayError {
    pub code: u16,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayErrorResponse {
    pub error: GatewayError,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
}

/// Render the gateway error envelope for a local response body.
pub fn format_gateway_response(err: &ErrCode, trace_id: &str, message: &str) -> Bytes {
    let resp = GatewayErrorResponse {
        error: GatewayError {
            code: err.code,
            kind: err.kind.to_string(),
            message: message.to_string(),
        },
        trace_id: trace_id.to_string(),
    };
    // Serialization of a plain string/int struct cannot fail.
    Bytes::from(serde_json::to_vec(&resp).unwrap_or_default())
}

impl std::fmt::Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "code={}, type={}, msg={}", self.code, self.kind, self.msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_literally() {
        let body = format_gateway_response(&ERR_NOT_FOUND, "trace-1", "no hosts in cluster c1");
        let parsed: GatewayErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.error.code, 404);
        assert_eq!(parsed.error.kind, "not_found");
        assert_eq!(parsed.error.message, "no hosts in cluster c1");
        assert_eq!(parsed.trace_id, "trace-1");

        // Formatting the parsed value again yields the same envelope.
        let again = format_gateway_response(
            &ERR_NOT_FOUND,
            &parsed.trace_id,
            &parsed.error.message,
        );
        assert_eq!(body, again);
    }

    #[test]
    fn empty_trace_id_is_omitted() {
        let body = format_gateway_response(&ERR_BAD_REQUEST, "", "bad json");
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(value.get("trace_id").is_none());
        assert_eq!(value["error"]["type"], "bad_request");
    }

    #[test]
    fn error_codes_match_http_statuses() {
        assert_eq!(ERR_BAD_REQUEST.code, 400);
        assert_eq!(ERR_NOT_FOUND.code, 404);
        assert_eq!(ERR_INFERENCE_SERVER.code, 503);
    }
}
