use axum::http::{header::HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use optics_codec::CodecError;
use optics_dataset::DatasetError;
use optics_lens::LensError;
use optics_resolve::ResolveError;

/// Header naming the attachments a rejected write was missing; clients
/// retry with those attachments included.
pub const RESEND_WITH_ATTACHMENTS: HeaderName =
    HeaderName::from_static("x-pigeon-optics-resend-with-attachments");

/// Server lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Node(#[from] optics_api::OpticsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Request-level errors, mapped onto status codes:
/// 400 for validation, decode failures, and missing attachments; 404 for
/// not-found; 409 for already-exists; 500 for storage faults.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Attach(#[from] optics_attach::AttachError),

    #[error(transparent)]
    Lens(#[from] LensError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Dataset(err) => dataset_status(err),
            Self::Resolve(ResolveError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Resolve(ResolveError::Unsupported(_)) => StatusCode::BAD_REQUEST,
            Self::Resolve(ResolveError::Dataset(err)) => dataset_status(err),
            Self::Attach(optics_attach::AttachError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Attach(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Lens(LensError::NotALens(_)) => StatusCode::BAD_REQUEST,
            Self::Lens(LensError::Dataset(err)) => dataset_status(err),
            Self::Lens(LensError::Resolve(_)) => StatusCode::NOT_FOUND,
            // Decode failures are client payload errors, uniformly 400.
            Self::Codec(_) => StatusCode::BAD_REQUEST,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

fn dataset_status(err: &DatasetError) -> StatusCode {
    match err {
        DatasetError::NotFound(_) => StatusCode::NOT_FOUND,
        DatasetError::AlreadyExists(_) => StatusCode::CONFLICT,
        DatasetError::MissingAttachments(_) | DatasetError::ValidationFailed(_) => {
            StatusCode::BAD_REQUEST
        }
        DatasetError::Attach(optics_attach::AttachError::NotFound(_)) => StatusCode::BAD_REQUEST,
        DatasetError::Attach(_) | DatasetError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));

        if let ApiError::Dataset(DatasetError::MissingAttachments(ref urls)) = self {
            let listed = urls
                .iter()
                .map(|url| format!("\"{url}\""))
                .collect::<Vec<_>>()
                .join(", ");
            return (status, [(RESEND_WITH_ATTACHMENTS, listed)], body).into_response();
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ApiError::Dataset(DatasetError::NotFound("x".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Dataset(DatasetError::AlreadyExists("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::Dataset(DatasetError::MissingAttachments(vec![])).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Codec(CodecError::Decode("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn missing_attachments_response_carries_header() {
        let err = ApiError::Dataset(DatasetError::MissingAttachments(vec![
            "hash://sha256/aa".into(),
            "hash://sha256/bb".into(),
        ]));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let header = response
            .headers()
            .get(RESEND_WITH_ATTACHMENTS)
            .unwrap()
            .to_str()
            .unwrap();
        assert_eq!(header, "\"hash://sha256/aa\", \"hash://sha256/bb\"");
    }
}
