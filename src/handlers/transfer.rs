use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::database::Database;
use crate::models::transfer_models::{
    AvailabilityView, BinValidationResult, CommittedTransferRequest, PendingTransaction,
    TransferError, TransferRequest, TransferResult,
};
use crate::services::TransferService;

/// Create transfer routes
pub fn create_transfer_routes() -> Router<Database> {
    Router::new()
        .route(
            "/availability/{item_key}/{location}/{lot_no}/{bin_no}",
            get(search_availability),
        )
        .route("/bin/{location}/{bin_no}", get(validate_bin))
        .route("/remarks", get(list_remarks))
        .route("/pending/{lot_no}/{bin_no}", get(list_pending))
        .route("/", post(execute_transfer))
        .route("/committed", post(execute_committed_transfer))
}

type HandlerError = (StatusCode, Json<serde_json::Value>);

/// Availability for a lot in one bin
/// GET /api/transfer/availability/{item_key}/{location}/{lot_no}/{bin_no}
async fn search_availability(
    State(database): State<Database>,
    Path((item_key, location, lot_no, bin_no)): Path<(String, String, String, String)>,
) -> Result<Json<AvailabilityView>, HandlerError> {
    let service = TransferService::new(database);
    service
        .search_availability(&item_key, &location, &lot_no, &bin_no)
        .await
        .map(Json)
        .map_err(error_envelope)
}

/// Validate destination bin
/// GET /api/transfer/bin/{location}/{bin_no}
async fn validate_bin(
    State(database): State<Database>,
    Path((location, bin_no)): Path<(String, String)>,
) -> Result<Json<BinValidationResult>, HandlerError> {
    let service = TransferService::new(database);
    service.validate_bin(&location, &bin_no).await.map(Json).map_err(error_envelope)
}

/// Active transfer remarks for the dropdown
/// GET /api/transfer/remarks
async fn list_remarks(
    State(database): State<Database>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let service = TransferService::new(database);
    match service.list_remarks().await {
        Ok(remarks) => Ok(Json(json!({
            "success": true,
            "data": remarks
        }))),
        Err(e) => Err(error_envelope(e)),
    }
}

/// Pending outbound transactions for a lot and bin
/// GET /api/transfer/pending/{lot_no}/{bin_no}
async fn list_pending(
    State(database): State<Database>,
    Path((lot_no, bin_no)): Path<(String, String)>,
) -> Result<Json<Vec<PendingTransaction>>, HandlerError> {
    let service = TransferService::new(database);
    service.list_pending(&lot_no, &bin_no).await.map(Json).map_err(error_envelope)
}

/// Execute free-quantity bin transfer
/// POST /api/transfer
async fn execute_transfer(
    State(database): State<Database>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<TransferResult>, HandlerError> {
    let service = TransferService::new(database);
    service.execute_transfer(request).await.map(Json).map_err(error_envelope)
}

/// Execute committed-quantity bin transfer
/// POST /api/transfer/committed
async fn execute_committed_transfer(
    State(database): State<Database>,
    Json(request): Json<CommittedTransferRequest>,
) -> Result<Json<TransferResult>, HandlerError> {
    let service = TransferService::new(database);
    service.execute_committed_transfer(request).await.map(Json).map_err(error_envelope)
}

/// Map an engine error onto the structured wire envelope. Business and
/// validation errors keep their context fields; system-class failures are
/// logged with a correlation id and surfaced opaquely.
fn error_envelope(error: TransferError) -> HandlerError {
    let kind = error.kind();

    let status = match &error {
        TransferError::LotNotFound { .. } => StatusCode::NOT_FOUND,
        TransferError::InvalidBin { .. }
        | TransferError::InsufficientQuantity { .. }
        | TransferError::InsufficientCommitted { .. }
        | TransferError::SelectionMismatch { .. }
        | TransferError::ValidationError(_) => StatusCode::BAD_REQUEST,
        TransferError::InventoryFrozen
        | TransferError::PhysicalCountInProgress { .. }
        | TransferError::NotTransferrable { .. } => StatusCode::CONFLICT,
        TransferError::Unauthorized => StatusCode::UNAUTHORIZED,
        TransferError::Contention(_) | TransferError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        TransferError::InvariantViolation(_)
        | TransferError::DatabaseError(_)
        | TransferError::TransactionError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = match &error {
        TransferError::LotNotFound { lot_no, bin_no } => json!({
            "success": false,
            "error": kind,
            "message": error.to_string(),
            "lot_no": lot_no,
            "bin_no": bin_no
        }),
        TransferError::InvalidBin { bin_no, location } => json!({
            "success": false,
            "error": kind,
            "message": error.to_string(),
            "bin_no": bin_no,
            "location": location
        }),
        TransferError::InsufficientQuantity { requested, available } => json!({
            "success": false,
            "error": kind,
            "message": error.to_string(),
            "requested": requested,
            "available": available
        }),
        TransferError::InsufficientCommitted { requested, committed } => json!({
            "success": false,
            "error": kind,
            "message": error.to_string(),
            "requested": requested,
            "committed": committed
        }),
        TransferError::SelectionMismatch { selected_total, requested } => json!({
            "success": false,
            "error": kind,
            "message": error.to_string(),
            "selected_total": selected_total,
            "requested": requested
        }),
        TransferError::PhysicalCountInProgress { item_key, location } => json!({
            "success": false,
            "error": kind,
            "message": error.to_string(),
            "item_key": item_key,
            "location": location
        }),
        TransferError::NotTransferrable { item_key } => json!({
            "success": false,
            "error": kind,
            "message": error.to_string(),
            "item_key": item_key
        }),
        TransferError::Contention(_) | TransferError::Timeout(_) => json!({
            "success": false,
            "error": kind,
            "message": error.to_string(),
            "retryable": true
        }),
        TransferError::InvariantViolation(_)
        | TransferError::DatabaseError(_)
        | TransferError::TransactionError(_) => {
            let correlation_id = Uuid::new_v4().to_string();
            tracing::error!(correlation_id = %correlation_id, "{error}");
            json!({
                "success": false,
                "error": kind,
                "message": "A system error occurred. Please contact support.",
                "correlation_id": correlation_id
            })
        }
        _ => json!({
            "success": false,
            "error": kind,
            "message": error.to_string()
        }),
    };

    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_quantity_envelope_carries_both_figures() {
        let (status, Json(body)) = error_envelope(TransferError::InsufficientQuantity {
            requested: 950.0,
            available: 925.0,
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "InsufficientQuantity");
        assert_eq!(body["requested"], 950.0);
        assert_eq!(body["available"], 925.0);
    }

    #[test]
    fn retryable_errors_surface_as_service_unavailable() {
        let (status, Json(body)) =
            error_envelope(TransferError::Contention("lock wait budget exhausted".into()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Contention");
        assert_eq!(body["retryable"], true);
    }

    #[test]
    fn system_errors_are_opaque_but_correlated() {
        let (status, Json(body)) =
            error_envelope(TransferError::DatabaseError("login failed for sa".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "SystemError");
        let message = body["message"].as_str().unwrap();
        assert!(!message.contains("sa"));
        assert!(body["correlation_id"].as_str().is_some());
    }

    #[test]
    fn precondition_failures_map_to_conflict() {
        let (status, Json(body)) = error_envelope(TransferError::InventoryFrozen);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "InventoryFrozen");
    }

    #[test]
    fn blank_user_maps_to_unauthorized() {
        let (status, Json(body)) = error_envelope(TransferError::Unauthorized);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Unauthorized");
    }
}
