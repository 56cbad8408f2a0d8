use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use thiserror::Error;

/// Failure taxonomy for the service. Parser and rule failures are handled
/// where they occur (logged, line or rule skipped); everything surfacing
/// here maps onto an HTTP status at the API boundary.
#[derive(Debug, Error)]
pub enum SiemError {
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization failure: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("export failure: {0}")]
    Export(#[from] csv::Error),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rule evaluation failed: {0}")]
    Rule(String),

    #[error("worker pool unavailable")]
    Canceled,
}

impl actix_web::ResponseError for SiemError {
    fn status_code(&self) -> StatusCode {
        match self {
            SiemError::NotFound(_) => StatusCode::NOT_FOUND,
            SiemError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SiemError::Storage(_)
            | SiemError::Serialize(_)
            | SiemError::Export(_)
            | SiemError::Rule(_)
            | SiemError::Canceled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "detail": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::ResponseError;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(SiemError::NotFound("alert").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            SiemError::BadRequest("bad date".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SiemError::Rule("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
