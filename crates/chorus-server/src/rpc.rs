use serde::{Deserialize, Serialize};

/// Inbound request frame.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub id: Option<serde_json::Value>,
}

/// Response frame: `{ id, success, result?, error?: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Option<serde_json::Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
}

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Map numeric error codes to the string codes sent on the wire.
pub fn error_code_to_string(code: i32) -> &'static str {
    match code {
        PARSE_ERROR => "PARSE_ERROR",
        INVALID_REQUEST => "INVALID_REQUEST",
        METHOD_NOT_FOUND => "METHOD_NOT_FOUND",
        INVALID_PARAMS => "INVALID_PARAMS",
        INTERNAL_ERROR => "INTERNAL_ERROR",
        _ => "UNKNOWN_ERROR",
    }
}

impl RpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(RpcError {
                code: error_code_to_string(code).to_string(),
                message: message.into(),
            }),
        }
    }

    pub fn method_not_found(id: Option<serde_json::Value>, method: &str) -> Self {
        Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(id: Option<serde_json::Value>, msg: impl Into<String>) -> Self {
        Self::error(id, INVALID_PARAMS, msg)
    }

    pub fn parse_error() -> Self {
        Self::error(None, PARSE_ERROR, "Parse error")
    }
}

/// Params of `chat.submit`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitParams {
    pub content: String,
    #[serde(default)]
    pub dedup_token: Option<String>,
    #[serde(default)]
    pub sender_label: Option<String>,
}

impl From<SubmitParams> for chorus_core::Submission {
    fn from(p: SubmitParams) -> Self {
        Self {
            content: p.content,
            dedup_token: p.dedup_token,
            sender_label: p.sender_label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_submit_request() {
        let json = r#"{"method":"chat.submit","params":{"content":"hi","dedupToken":"t1"},"id":7}"#;
        let req: RpcRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.method, "chat.submit");
        assert_eq!(req.id, Some(serde_json::json!(7)));
        let params: SubmitParams = serde_json::from_value(req.params.unwrap()).unwrap();
        assert_eq!(params.content, "hi");
        assert_eq!(params.dedup_token.as_deref(), Some("t1"));
        assert!(params.sender_label.is_none());
    }

    #[test]
    fn submit_params_require_content() {
        let err = serde_json::from_value::<SubmitParams>(serde_json::json!({"dedupToken": "x"}));
        assert!(err.is_err());
    }

    #[test]
    fn success_response_shape() {
        let resp = RpcResponse::success(
            Some(serde_json::json!(1)),
            serde_json::json!({"status": "accepted", "sequence": 3}),
        );
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["result"]["sequence"], 3);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn error_response_has_string_code() {
        let resp = RpcResponse::invalid_params(Some(serde_json::json!("a")), "bad param");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "INVALID_PARAMS");
        assert_eq!(json["error"]["message"], "bad param");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn parse_error_has_null_id() {
        let json = serde_json::to_value(RpcResponse::parse_error()).unwrap();
        assert!(json["id"].is_null());
        assert_eq!(json["error"]["code"], "PARSE_ERROR");
    }

    #[test]
    fn method_not_found_names_method() {
        let resp = RpcResponse::method_not_found(None, "chat.edit");
        assert!(resp.error.unwrap().message.contains("chat.edit"));
    }

    #[test]
    fn unknown_code_maps_to_unknown() {
        assert_eq!(error_code_to_string(-1), "UNKNOWN_ERROR");
    }
}
