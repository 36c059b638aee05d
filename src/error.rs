//! Error handling.

use axum::{
    extract::multipart::MultipartError,
    extract::rejection::{JsonRejection, QueryRejection},
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use ndarray::ShapeError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tiff::TiffError;
use tracing::{event, Level};

use crate::models::Axis;

/// Hyperstack error type
///
/// This type encapsulates the various errors that may occur while loading and processing an
/// image volume or while handling a request. Each variant may result in a different API error
/// response.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Image on disk does not have exactly five dimensions
    #[error("image must be 5D (X, Y, Z, Time, Channel), found {} dimensions {shape:?}", shape.len())]
    Shape { shape: Vec<usize> },

    /// TIFF pages do not form the array described by the file
    #[error("invalid TIFF layout: {reason}")]
    Layout { reason: String },

    /// Slice index outside the extent of an axis
    #[error("index {index} is out of range for axis {axis} with length {length}")]
    IndexOutOfRange {
        axis: Axis,
        index: isize,
        length: usize,
    },

    /// Attempt to perform an operation on a volume without usable samples
    #[error("cannot perform {operation} on empty volume: {reason}")]
    EmptyVolume {
        operation: &'static str,
        reason: String,
    },

    /// Attempt to segment a channel without elements
    #[error("channel {channel} has no elements to segment")]
    EmptyChannel { channel: usize },

    /// Number of PCA components outside `1..=channels`
    #[error("number of PCA components must be between 1 and {channels}, got {components}")]
    InvalidComponentCount { components: usize, channels: usize },

    /// The incremental PCA fit could not produce a model
    #[error("PCA fit failed: {reason}")]
    PcaFit { reason: String },

    /// Channel index outside `0..channels`
    #[error("channel {channel} is out of range for image with {channels} channels")]
    InvalidChannel { channel: usize, channels: usize },

    /// Number of clusters less than one
    #[error("number of clusters must be at least 1, got {k}")]
    InvalidClusterCount { k: usize },

    /// Sample type that cannot be represented as a [DType](crate::models::DType)
    #[error("unsupported sample format {format} with {bits} bits per sample")]
    UnsupportedSampleType { format: u16, bits: u8 },

    /// Requested image file does not exist
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// Upload request without a file
    #[error("no file provided")]
    NoFileProvided,

    /// Uploaded file is not a TIFF file
    #[error("invalid file format {filename}, only .tif and .tiff are allowed")]
    InvalidFileType { filename: String },

    /// Error deserialising a JSON request body
    #[error("request data is not valid")]
    RequestDataJsonRejection(#[from] JsonRejection),

    /// Error deserialising request query parameters
    #[error("request query is not valid")]
    RequestQueryRejection(#[from] QueryRejection),

    /// Error validating request data
    #[error("request data is not valid")]
    RequestDataValidation(#[from] validator::ValidationErrors),

    /// Error reading a multipart upload
    #[error("failed to read uploaded file")]
    Multipart(#[from] MultipartError),

    /// Error decoding or encoding TIFF data
    #[error("failed to process TIFF data")]
    Tiff(#[from] TiffError),

    /// Error reading or writing files
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Error creating ndarray Array from Shape
    #[error("failed to create array from shape")]
    ShapeInvalid(#[from] ShapeError),

    /// Error accessing the metadata store
    #[error("metadata store error")]
    Store(#[from] sled::Error),

    /// Error (de)serialising a metadata record
    #[error("failed to serialise metadata record")]
    Serialization(#[from] serde_json::Error),

    /// A processing task panicked or was cancelled
    #[error("processing task failed")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
}

impl IntoResponse for ProcessingError {
    /// Convert from a `ProcessingError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    /// Return a new ErrorResponse
    ///
    /// # Arguments
    ///
    /// * `status`: HTTP status of the response
    /// * `error`: The error that occurred. This will be formatted into a suitable `ErrorBody`
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }

    /// Return a 400 bad request ErrorResponse
    fn bad_request<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    /// Return a 500 internal server error ErrorResponse
    fn internal_server_error<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl From<ProcessingError> for ErrorResponse {
    /// Convert from a `ProcessingError` into an `ErrorResponse`.
    fn from(error: ProcessingError) -> Self {
        let response = match &error {
            // Bad request
            ProcessingError::Shape { shape: _ }
            | ProcessingError::Layout { reason: _ }
            | ProcessingError::IndexOutOfRange {
                axis: _,
                index: _,
                length: _,
            }
            | ProcessingError::EmptyVolume {
                operation: _,
                reason: _,
            }
            | ProcessingError::EmptyChannel { channel: _ }
            | ProcessingError::InvalidComponentCount {
                components: _,
                channels: _,
            }
            | ProcessingError::PcaFit { reason: _ }
            | ProcessingError::InvalidChannel {
                channel: _,
                channels: _,
            }
            | ProcessingError::InvalidClusterCount { k: _ }
            | ProcessingError::UnsupportedSampleType { format: _, bits: _ }
            | ProcessingError::FileNotFound { path: _ }
            | ProcessingError::NoFileProvided
            | ProcessingError::InvalidFileType { filename: _ }
            | ProcessingError::RequestDataJsonRejection(_)
            | ProcessingError::RequestQueryRejection(_)
            | ProcessingError::RequestDataValidation(_)
            | ProcessingError::Multipart(_) => Self::bad_request(&error),

            // Malformed or unsupported files are the caller's problem, anything else
            // (I/O, limits) is ours.
            ProcessingError::Tiff(tiff_error) => match tiff_error {
                TiffError::FormatError(_) | TiffError::UnsupportedError(_) => {
                    Self::bad_request(&error)
                }
                _ => Self::internal_server_error(&error),
            },

            // Internal server error
            ProcessingError::Io(_)
            | ProcessingError::ShapeInvalid(_)
            | ProcessingError::Store(_)
            | ProcessingError::Serialization(_)
            | ProcessingError::TaskJoin(_)
            | ProcessingError::TryFromInt(_) => Self::internal_server_error(&error),
        };

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}
