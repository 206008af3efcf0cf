// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP-facing errors.
//!
//! Every error response carries a reference code (`ERR-YYYYMMDD-XXXXXX`) that
//! also appears in the server log next to the full, sanitized detail. Clients
//! see a short message; credentials, file paths and addresses never leave the
//! process.
//!
//! ```text
//! {"error":{"error_type":"not_found","message":"Job not found","reference":"ERR-20250101-A3F8K2"},"status":404}
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::error::JobError;

// =============================================================================
// REFERENCE CODES
// =============================================================================

/// Unambiguous alphabet: no 0/O or 1/I.
const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generate a reference code, e.g. `ERR-20250115-A3F8K2`.
pub fn generate_reference_code() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| REFERENCE_ALPHABET[rng.gen_range(0..REFERENCE_ALPHABET.len())] as char)
        .collect();
    format!("ERR-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

// =============================================================================
// API ERROR
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum ApiError {
    /// 400
    InvalidRequest {
        message: String,
        reference: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    /// 404
    NotFound { message: String, reference: String },
    /// 409
    Conflict { message: String, reference: String },
    /// 500
    InternalError { message: String, reference: String },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            ApiError::InvalidRequest { reference, .. }
            | ApiError::NotFound { reference, .. }
            | ApiError::Conflict { reference, .. }
            | ApiError::InternalError { reference, .. } => reference,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::InvalidRequest { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::InternalError { message, .. } => message,
        }
    }

    // -------------------------------------------------------------------------
    // Constructors; each logs under its reference code.
    // -------------------------------------------------------------------------

    pub fn invalid_request(message: impl Into<String>, field: Option<&str>) -> Self {
        let reference = generate_reference_code();
        let message = message.into();
        tracing::warn!(reference = %reference, field = ?field, detail = %sanitize_error_details(&message), "Invalid request");
        Self::InvalidRequest {
            message,
            reference,
            field: field.map(str::to_string),
        }
    }

    pub fn not_found(resource: &str) -> Self {
        let reference = generate_reference_code();
        tracing::debug!(reference = %reference, resource, "Not found");
        Self::NotFound {
            message: format!("{} not found", resource),
            reference,
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        let reference = generate_reference_code();
        let message = message.into();
        tracing::info!(reference = %reference, detail = %message, "Conflict");
        Self::Conflict { message, reference }
    }

    /// Logs the sanitized detail; the client gets a generic message.
    pub fn internal(internal: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(reference = %reference, internal_error = %sanitize_error_details(internal), "Internal error");
        Self::InternalError {
            message: "An unexpected error occurred. Please contact support with the reference code.".to_string(),
            reference,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a ApiError,
    status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::to_string(&ErrorBody {
            error: &self,
            status: status.as_u16(),
        })
        .unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#
                .to_string()
        });
        (status, [("content-type", "application/json")], body).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::InvalidInput(message) => ApiError::invalid_request(message, Some("app_id")),
            JobError::NotFound(_) => ApiError::not_found("Job"),
            JobError::AlreadyActive { .. } | JobError::InvalidState { .. } | JobError::Finalizing(_) => {
                ApiError::conflict(error.to_string())
            }
        }
    }
}

// =============================================================================
// SANITIZATION
// =============================================================================

/// Patterns scrubbed from anything that reaches a log line or a client.
static SANITIZE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        // Utility login arguments: user, password, guard code
        (Regex::new(r"\+login\s+\S+(?:\s+[^\s+]\S*){0,2}").unwrap(), "+login [REDACTED]"),
        (Regex::new(r"(?i)\b(password|passwd|guard_code)\s*[=:]\s*[^\s,;&]+").unwrap(), "$1=[REDACTED]"),
        (Regex::new(r"Bearer [a-zA-Z0-9._~+/-]+=*").unwrap(), "Bearer [TOKEN_REDACTED]"),
        // Paths
        (Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root|data|app|srv|mnt)/[^\s]*").unwrap(), "[PATH_REDACTED]"),
        (Regex::new(r"[A-Za-z]:\\[^\s]+").unwrap(), "[PATH_REDACTED]"),
        // Addresses
        (Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(?::\d+)?\b").unwrap(), "[IP_REDACTED]"),
        (Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(), "[EMAIL_REDACTED]"),
        // Panic locations
        (Regex::new(r"at [^\s]+\.rs:\d+:\d+").unwrap(), "[LOCATION_REDACTED]"),
    ]
});

/// Strip credentials, paths and addresses from free text.
pub fn sanitize_error_details(error: &str) -> String {
    SANITIZE_PATTERNS
        .iter()
        .fold(error.to_string(), |text, (pattern, replacement)| {
            pattern.replace_all(&text, *replacement).into_owned()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobId, JobState};
    use axum::body::to_bytes;

    #[test]
    fn test_reference_code_format() {
        let code = generate_reference_code();
        assert!(code.starts_with("ERR-"));
        assert_eq!(code.len(), 19);
        let suffix = &code[13..];
        assert!(suffix.bytes().all(|b| REFERENCE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_job_errors_map_to_status() {
        let cases = [
            (JobError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (JobError::NotFound(JobId::from("x")), StatusCode::NOT_FOUND),
            (
                JobError::InvalidState {
                    job_id: JobId::from("x"),
                    state: JobState::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (
                JobError::AlreadyActive {
                    target: "740".into(),
                    job_id: JobId::from("x"),
                },
                StatusCode::CONFLICT,
            ),
            (JobError::Finalizing(JobId::from("x")), StatusCode::CONFLICT),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status_code(), status);
        }
    }

    #[test]
    fn test_sanitize_login_arguments() {
        let text = "spawn failed: steamcmd +force_install_dir x +login someone hunter2 F00D +app_update 740";
        let clean = sanitize_error_details(text);
        assert!(!clean.contains("hunter2"));
        assert!(!clean.contains("F00D"));
        assert!(!clean.contains("someone"));
        assert!(clean.contains("+app_update 740"));
    }

    #[test]
    fn test_sanitize_paths_and_addresses() {
        let clean = sanitize_error_details("cannot write /data/downloads/abc from 10.0.0.7:8080 password=swordfish");
        assert!(!clean.contains("/data/downloads"));
        assert!(!clean.contains("10.0.0.7"));
        assert!(!clean.contains("swordfish"));
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let error = ApiError::internal("io error at /data/state/jobs.json");
        assert!(!error.message().contains("/data"));
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_response_body_shape() {
        let error = ApiError::not_found("Job");
        let reference = error.reference().to_string();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], 404);
        assert_eq!(json["error"]["error_type"], "not_found");
        assert_eq!(json["error"]["reference"], reference.as_str());
    }
}
