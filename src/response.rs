use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// One entry of the `errors` array. `field` is set for input validation errors.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ErrorDetail {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            field: None,
            message: message.into(),
        }
    }
}

/// Uniform `{success, message, data, errors}` body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    pub errors: Vec<ErrorDetail>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            errors: Vec::new(),
        }
    }
}

impl Envelope<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            errors: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>, errors: Vec<ErrorDetail>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            errors,
        }
    }
}

/// Successful bodies default to 200; handlers wrap in `(StatusCode, _)` for others
/// and failures go through `ApiError`, which carries its own status.
impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_envelope_serializes_null_data_and_empty_errors() {
        let json = serde_json::to_value(Envelope::message("done")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"success": true, "message": "done", "data": null, "errors": []})
        );
    }

    #[test]
    fn envelope_responds_ok() {
        let res = Envelope::ok("done", serde_json::json!({"id": 1})).into_response();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(Envelope::message("done").into_response().status(), StatusCode::OK);
    }

    #[test]
    fn general_error_omits_field() {
        let json = serde_json::to_value(ErrorDetail::general("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"message": "boom"}));
    }
}
