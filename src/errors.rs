//! S3-compatible error types.
//!
//! Every variant maps to a stable S3 error code. The enum implements
//! [`axum::response::IntoResponse`] so the dispatcher can turn any failure
//! into a well-formed XML error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::storage::backend::StorageError;
use crate::xml::render_error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// S3 error codes expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum S3Error {
    /// Verb not registered for the route.
    #[error("The specified method is not allowed against this resource.")]
    MethodNotAllowed,

    /// Signature mismatch or malformed authorization header.
    #[error("The request signature could not be verified.")]
    UnauthorizedAccess,

    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The resource you requested does not exist")]
    NoSuchKey { key: String },

    /// A bucket (or any directory) with the requested name already exists.
    #[error("The requested bucket name is not available. Please select a different name and try again.")]
    BucketAlreadyExists { bucket: String },

    /// The bucket you tried to delete is not empty.
    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    /// An invalid bucket name was provided.
    #[error("The specified bucket is not valid.")]
    InvalidBucketName { name: String },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String, resource: String },

    /// Malformed XML in request body.
    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    /// The request body exceeds the configured limit.
    #[error("Your proposed upload exceeds the maximum allowed object size.")]
    EntityTooLarge,

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// Return the S3 XML error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::MethodNotAllowed => "MethodNotAllowed",
            S3Error::UnauthorizedAccess => "UnauthorizedAccess",
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            S3Error::BucketNotEmpty { .. } => "BucketNotEmpty",
            S3Error::InvalidBucketName { .. } => "InvalidBucketName",
            S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::EntityTooLarge => "EntityTooLarge",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            S3Error::UnauthorizedAccess => StatusCode::UNAUTHORIZED,
            S3Error::NoSuchBucket { .. } => StatusCode::BAD_REQUEST,
            S3Error::NoSuchKey { .. } => StatusCode::BAD_REQUEST,
            S3Error::BucketAlreadyExists { .. } => StatusCode::CONFLICT,
            S3Error::BucketNotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::InvalidBucketName { .. } => StatusCode::BAD_REQUEST,
            S3Error::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::EntityTooLarge => StatusCode::BAD_REQUEST,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The bucket or key the error refers to, empty when there is none.
    pub fn resource(&self) -> &str {
        match self {
            S3Error::NoSuchBucket { bucket }
            | S3Error::BucketAlreadyExists { bucket }
            | S3Error::BucketNotEmpty { bucket } => bucket,
            S3Error::NoSuchKey { key } => key,
            S3Error::InvalidBucketName { name } => name,
            S3Error::InvalidArgument { resource, .. } => resource,
            _ => "",
        }
    }
}

impl From<StorageError> for S3Error {
    fn from(err: StorageError) -> Self {
        S3Error::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        let body = render_error(self.code(), &self.to_string(), self.resource(), &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
                ("date", date),
                ("server", "dirstore".to_string()),
            ],
            body,
        )
            .into_response()
    }
}
