//! Standardized classification of HTTP and transport failures

use crate::error::SyncerError;
use reqwest::StatusCode;

/// Longest response body excerpt carried into an error message
const MAX_ERROR_BODY: usize = 256;

/// Standard error handler for HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Handle registry-related HTTP errors.
    ///
    /// 401/403 become `Auth`, 404 becomes `NotFound`, everything else is a
    /// `Network` failure.
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
    ) -> SyncerError {
        let error_text = Self::excerpt(error_text);
        match status.as_u16() {
            401 => SyncerError::Auth(format!(
                "Unauthorized to perform {}: {}",
                operation, error_text
            )),
            403 => SyncerError::Auth(format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, error_text
            )),
            404 => SyncerError::NotFound(format!("{}: {}", operation, error_text)),
            429 => SyncerError::Network(format!("Rate limited during {}: {}", operation, error_text)),
            500 => SyncerError::Network(format!(
                "Registry server error during {}: {}",
                operation, error_text
            )),
            502..=504 => SyncerError::Network(format!(
                "Registry unavailable for {}: {}",
                operation, error_text
            )),
            _ => SyncerError::Network(format!(
                "{} failed (status {}): {}",
                operation, status, error_text
            )),
        }
    }

    /// Handle authentication-related HTTP errors
    pub fn handle_auth_error(status: StatusCode, error_text: &str) -> SyncerError {
        let error_msg = match status.as_u16() {
            400 => "Invalid token request parameters".to_string(),
            401 => "Invalid credentials provided".to_string(),
            403 => "Access denied - insufficient permissions".to_string(),
            404 => "Authentication endpoint not found".to_string(),
            _ => format!(
                "Authentication failed (status {}): {}",
                status,
                Self::excerpt(error_text)
            ),
        };

        SyncerError::Auth(error_msg)
    }

    fn excerpt(text: &str) -> String {
        let text = text.trim();
        if text.len() <= MAX_ERROR_BODY {
            return text.to_string();
        }
        let mut end = MAX_ERROR_BODY;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize and format network errors with helpful context
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> SyncerError {
        if error.is_decode() {
            SyncerError::Decode(format!("{}: malformed response: {}", context, error))
        } else if error.is_timeout() {
            SyncerError::Network(format!("{} timed out: {}", context, error))
        } else if error.is_connect() {
            SyncerError::Network(format!("Connection error during {}: {}", context, error))
        } else if error.is_builder() {
            SyncerError::Config(format!("Invalid request for {}: {}", context, error))
        } else {
            SyncerError::Network(format!("{} network error: {}", context, error))
        }
    }
}
