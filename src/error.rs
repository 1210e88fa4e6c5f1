//! Error taxonomy shared by the connection core and the request pipeline.
//!
//! The `Display` text of each variant is exactly what ends up in the
//! default error body (`Error: <message>`), so keep it short and human.

use crate::http::parser::ParseError;
use crate::http::response::StatusCode;
use thiserror::Error;

/// Conditions that end a request with an error response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    /// Malformed request syntax.
    #[error("{0}")]
    InvalidUsage(String),

    /// Request body or declared `Content-Length` above the configured ceiling.
    #[error("{0}")]
    PayloadTooLarge(String),

    /// The connection stayed busy or idle past the request timeout.
    #[error("{0}")]
    RequestTimeout(String),

    /// The pipeline produced no usable response, or failed in an unclassified way.
    #[error("{0}")]
    ServerError(String),
}

impl HttpError {
    pub fn bad_request() -> Self {
        HttpError::InvalidUsage("Bad Request".to_string())
    }

    pub fn payload_too_large() -> Self {
        HttpError::PayloadTooLarge("Payload Too Large".to_string())
    }

    pub fn request_timeout() -> Self {
        HttpError::RequestTimeout("Request Timeout".to_string())
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        HttpError::ServerError(message.into())
    }

    /// Status code sent to the client for this condition.
    pub fn status(&self) -> StatusCode {
        match self {
            HttpError::InvalidUsage(_) => StatusCode::BAD_REQUEST,
            HttpError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            HttpError::RequestTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            HttpError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ParseError> for HttpError {
    fn from(_: ParseError) -> Self {
        HttpError::bad_request()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(HttpError::bad_request().status().as_u16(), 400);
        assert_eq!(HttpError::payload_too_large().status().as_u16(), 413);
        assert_eq!(HttpError::request_timeout().status().as_u16(), 408);
        assert_eq!(HttpError::server_error("boom").status().as_u16(), 500);
    }

    #[test]
    fn parse_errors_become_bad_request() {
        let err: HttpError = ParseError::InvalidMethod.into();
        assert_eq!(err.to_string(), "Bad Request");
    }
}
