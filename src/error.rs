use crate::{detector::DetectorError, response::ErrorBody};
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::{error::Error as _, panic::Location};
use thiserror::Error;

const VALIDATION_ERROR: &str = "ValidationError";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid multipart body: {0}")]
    Multipart(#[source] MultipartError),
    #[error("Uploaded file exceeds the size limit")]
    FileTooLarge(#[source] MultipartError),
    #[error("No `file` field in the upload")]
    MissingFile,
    #[error("File must be an image")]
    InvalidContentType,
    #[error("Uploaded file is empty")]
    EmptyFile,
    #[error("Uploaded file is not a valid image: {0}")]
    InvalidImage(#[source] image::ImageError),
    #[error("{source}")]
    Processing {
        source: DetectorError,
        location: &'static Location<'static>,
        expose_details: bool,
    },
    #[error("Detection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::FileTooLarge(err)
        } else {
            ApiError::Multipart(err)
        }
    }
}

impl ApiError {
    /// Wraps a detector failure, remembering where it reached the handler.
    #[track_caller]
    pub fn processing(source: DetectorError, expose_details: bool) -> Self {
        ApiError::Processing {
            source,
            location: Location::caller(),
            expose_details,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Processing { .. } | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::FileTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Multipart(_) => "invalid_multipart",
            ApiError::FileTooLarge(_) => "file_too_large",
            ApiError::MissingFile => "missing_file",
            ApiError::InvalidContentType => "invalid_content_type",
            ApiError::EmptyFile => "empty_file",
            ApiError::InvalidImage(_) => "invalid_image",
            ApiError::Processing { .. } | ApiError::Task(_) => "detection_failed",
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Processing { source, .. } => source.kind(),
            ApiError::Task(_) => "TaskError",
            _ => VALIDATION_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        let mut body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
            kind: self.kind().to_string(),
            traceback: None,
            error_line: None,
        };

        if let ApiError::Processing {
            source,
            location,
            expose_details: true,
        } = self
        {
            let mut chain = vec![format!("{}: {}", source.kind(), source)];
            let mut cause = source.source();
            while let Some(err) = cause {
                chain.push(err.to_string());
                cause = err.source();
            }
            body.traceback = Some(chain);
            body.error_line = Some(location.to_string());
        }

        body
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        } else {
            tracing::warn!(error = %self, code = self.code(), "Rejected request");
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_are_bad_requests() {
        for err in [
            ApiError::MissingFile,
            ApiError::InvalidContentType,
            ApiError::EmptyFile,
        ] {
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
            let body = err.body();
            assert_eq!(body.kind, VALIDATION_ERROR);
            assert!(body.traceback.is_none());
        }
        assert_eq!(ApiError::InvalidContentType.body().message, "File must be an image");
    }

    #[test]
    fn test_processing_error_keeps_message() {
        let source = DetectorError::Inference("tensor exploded".to_string());
        let expected = source.to_string();

        let err = ApiError::processing(source, false);
        let body = err.body();

        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "detection_failed");
        assert_eq!(body.message, expected);
        assert_eq!(body.kind, "InferenceError");
        assert!(body.traceback.is_none());
        assert!(body.error_line.is_none());
    }

    #[test]
    fn test_processing_error_exposes_details() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "weights missing");
        let err = ApiError::processing(DetectorError::Io(io), true);

        let body = err.body();

        assert_eq!(body.kind, "IoError");
        let traceback = body.traceback.unwrap();
        assert_eq!(traceback[0], "IoError: Model file I/O failed: weights missing");
        assert_eq!(traceback[1], "weights missing");
        assert!(body.error_line.unwrap().contains("error.rs"));
    }
}
