use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{QUANTITY_TOLERANCE, TRAN_TYPE_ISSUE, TRAN_TYPE_RECEIPT, USER_ID_MAX_LEN};

/// Engine error taxonomy. Every variant maps to one wire-level error kind
/// via [`TransferError::kind`]; Contention and Timeout are retryable by the
/// caller with backoff, the engine never retries internally.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Lot '{lot_no}' not found in bin '{bin_no}'")]
    LotNotFound { lot_no: String, bin_no: String },

    #[error("Bin '{bin_no}' is not valid in location '{location}'")]
    InvalidBin { bin_no: String, location: String },

    #[error("Requested {requested} but only {available} available")]
    InsufficientQuantity { requested: f64, available: f64 },

    #[error("Requested {requested} exceeds committed quantity {committed}")]
    InsufficientCommitted { requested: f64, committed: f64 },

    #[error("Selected pending transactions total {selected_total}, expected {requested}")]
    SelectionMismatch { selected_total: f64, requested: f64 },

    #[error("Inventory is frozen by system parameter")]
    InventoryFrozen,

    #[error("Physical count in progress for item '{item_key}' at location '{location}'")]
    PhysicalCountInProgress { item_key: String, location: String },

    #[error("Item '{item_key}' is not lot-tracked and multi-bin enabled")]
    NotTransferrable { item_key: String },

    #[error("Missing or blank user id")]
    Unauthorized,

    #[error("Lock contention: {0}")]
    Contention(String),

    #[error("Statement timed out: {0}")]
    Timeout(String),

    #[error("Stock invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),
}

impl TransferError {
    /// Wire-level error kind written into the `error` field of the envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::LotNotFound { .. } => "LotNotFound",
            TransferError::InvalidBin { .. } => "InvalidBin",
            TransferError::InsufficientQuantity { .. } => "InsufficientQuantity",
            TransferError::InsufficientCommitted { .. } => "InsufficientCommitted",
            TransferError::SelectionMismatch { .. } => "SelectionMismatch",
            TransferError::InventoryFrozen => "InventoryFrozen",
            TransferError::PhysicalCountInProgress { .. } => "PhysicalCountInProgress",
            TransferError::NotTransferrable { .. } => "NotTransferrable",
            TransferError::Unauthorized => "Unauthorized",
            TransferError::Contention(_) => "Contention",
            TransferError::Timeout(_) => "Timeout",
            TransferError::InvariantViolation(_) => "InvariantViolation",
            TransferError::ValidationError(_) => "ValidationError",
            TransferError::DatabaseError(_) | TransferError::TransactionError(_) => "SystemError",
        }
    }

    /// Whether the caller may retry the request with jittered backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Contention(_) | TransferError::Timeout(_))
    }
}

/// Availability snapshot for a lot in one bin.
///
/// `pending_commit` is the legacy-parity figure: the sum of issued quantities
/// on active outbound audit rows for the same key. The batch job keeps it in
/// agreement with `committed_sales` modulo rows it has already finalized.
#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityView {
    pub lot_no: String,
    pub item_key: String,
    pub location: String,
    pub bin_no: String,
    pub on_hand: f64,
    pub committed_sales: f64,
    pub available: f64,
    pub pending_commit: f64,
}

/// Source lot row as read under the update lock inside a transfer transaction.
#[derive(Debug, Clone)]
pub struct LockedLot {
    pub qty_on_hand: f64,
    pub qty_commit_sales: f64,
    pub date_received: NaiveDateTime,
    pub date_expiry: Option<NaiveDateTime>,
    pub vendor_key: String,
    pub vendor_lot_no: String,
    pub lot_status: String,
}

/// Free-quantity transfer request (wire contract).
#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub lot_no: String,
    pub item_key: String,
    pub location: String,
    pub bin_from: String,
    pub bin_to: String,
    pub transfer_qty: f64,
    pub user_id: String,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub referenced: Option<String>,
}

/// Committed-quantity transfer request. When `selected_tran_nos` is absent the
/// request consumes the full commitment; a partial quantity requires an
/// explicit selection of pending audit rows summing exactly to it.
#[derive(Debug, Clone, Deserialize)]
pub struct CommittedTransferRequest {
    pub lot_no: String,
    pub item_key: String,
    pub location: String,
    pub bin_from: String,
    pub bin_to: String,
    pub transfer_qty: f64,
    pub user_id: String,
    #[serde(default)]
    pub selected_tran_nos: Option<Vec<i32>>,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub referenced: Option<String>,
}

/// Successful transfer response.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub success: bool,
    pub document_no: String,
    pub message: String,
    pub timestamp: String,
    pub source_lot_status: String,
    pub destination_lot_status: String,
    pub receipt: TransferReceipt,
}

/// Printable transfer receipt. Rendering and pagination are the caller's
/// concern; the engine only assembles the payload.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub document_no: String,
    pub item_key: String,
    pub location: String,
    pub bin_from: String,
    pub bin_to: String,
    pub lot_no: String,
    pub qty_on_hand: f64,
    pub transfer_qty: String,
    pub lot_status: String,
    pub date: String,
    pub remarks: String,
    pub referenced: String,
}

/// Pending outbound transaction on a lot/bin, as shown to the committed-path
/// picker.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTransaction {
    pub lot_tran_no: i32,
    pub lot_no: String,
    pub bin_no: String,
    pub doc_no: String,
    pub line_no: Option<i16>,
    pub qty: f64,
    pub transaction_type: u8,
    pub type_name: String,
    pub transaction_date: String,
    pub status: String,
}

/// Approved transfer remark option.
#[derive(Debug, Clone, Serialize)]
pub struct RemarkOption {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BinValidationResult {
    pub is_valid: bool,
    pub bin_no: String,
    pub location: String,
    pub message: String,
}

/// One leg of the paired audit write. The two legs populate different
/// document columns, so the variant carries only what its leg writes.
#[derive(Debug, Clone)]
pub enum AuditLeg {
    Issue { doc_no: String, line_no: i16, qty_issued: f64 },
    Receipt { doc_no: String, line_no: i16, qty_received: f64 },
}

impl AuditLeg {
    pub fn transaction_type(&self) -> u8 {
        match self {
            AuditLeg::Issue { .. } => TRAN_TYPE_ISSUE,
            AuditLeg::Receipt { .. } => TRAN_TYPE_RECEIPT,
        }
    }
}

/// Common audit-row context echoed from the source lot row, shared by both
/// legs of a transfer.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub lot_no: String,
    pub item_key: String,
    pub location: String,
    pub bin_no: String,
    pub vendor_key: String,
    pub vendor_lot_no: String,
    pub date_received: NaiveDateTime,
    pub date_expiry: Option<NaiveDateTime>,
    pub user_id: String,
    pub recorded_at: NaiveDateTime,
}

/// What the committed path consumes: the whole commitment, or an explicit
/// subset of pending audit rows.
#[derive(Debug, Clone, PartialEq)]
pub enum CommittedPlan {
    ConsumeAll,
    ConsumeSubset(Vec<i32>),
}

/// Treat absolute differences below the milligram tolerance as equal.
pub fn quantities_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < QUANTITY_TOLERANCE
}

/// True when `requested` exceeds `available` beyond tolerance.
pub fn exceeds_available(requested: f64, available: f64) -> bool {
    requested > available + QUANTITY_TOLERANCE
}

/// Validate a requested transfer quantity: positive, at most three fractional
/// digits. Quantities arrive pre-rounded from the caller; a finer scale is a
/// malformed request, not something to round away silently.
pub fn validate_transfer_qty(qty: f64) -> Result<(), TransferError> {
    if !qty.is_finite() || qty <= 0.0 {
        return Err(TransferError::ValidationError(
            "Transfer quantity must be greater than 0".to_string(),
        ));
    }
    let scaled = qty * 1000.0;
    if (scaled - scaled.round()).abs() > 1e-6 {
        return Err(TransferError::ValidationError(
            "Transfer quantity must have at most three decimal places".to_string(),
        ));
    }
    Ok(())
}

/// Format a document number for the BT series, e.g. `BT-00001234`.
pub fn format_document_no(sequence: i32) -> String {
    format!("BT-{sequence:08}")
}

/// Receipt lot status: the single source status when both sides agree,
/// otherwise `"<source> - <destination>"`.
pub fn combine_lot_status(source: &str, destination: Option<&str>) -> String {
    match destination {
        Some(dest) if !dest.is_empty() && dest != source => format!("{source} - {dest}"),
        _ => source.to_string(),
    }
}

/// Truthy check for legacy single-character parameter flags.
pub fn flag_set(value: &str) -> bool {
    matches!(value.trim(), "Y" | "y" | "1" | "T" | "t" | "true" | "TRUE")
}

/// Lot tracking flag accepts lot- or serial-tracked markers.
pub fn is_serial_lot_tracked(value: &str) -> bool {
    matches!(value.trim(), "L" | "S" | "Y")
}

/// Human-readable transaction type names, matching the legacy picker display.
pub fn transaction_type_name(transaction_type: u8) -> &'static str {
    match transaction_type {
        1 => "Purchase Receipt",
        2 => "Purchase Return",
        3 => "Sales Issue",
        4 => "Sales Return",
        5 => "Mfg. Issue",
        6 => "Mfg. Return",
        7 => "Inventory Transfer",
        8 => "Inventory Adj. Positive",
        9 => "Inventory Adj. Negative",
        10 => "Damaged",
        11 => "Warehouse Move In",
        12 => "Warehouse Move Out",
        14 => "Physical Count",
        15 => "Transfer In",
        16 => "Transfer Out",
        17 => "Move",
        18 => "Mfg. Receipt",
        21 => "Sales Provisional",
        _ => "Unknown",
    }
}

/// Truncate a user id to the width of the legacy audit columns.
pub fn truncate_user_id(user_id: &str) -> &str {
    if user_id.len() > USER_ID_MAX_LEN {
        &user_id[0..USER_ID_MAX_LEN]
    } else {
        user_id
    }
}

/// Decide how a committed-quantity transfer consumes the source commitment.
///
/// Three scenarios against the locked `committed_sales` figure:
/// - over-commitment fails outright,
/// - an exact match (within tolerance) consumes the whole commitment,
/// - a partial quantity requires an explicit selection of pending rows whose
///   issued quantities sum exactly to the requested amount.
pub fn plan_committed_consumption(
    requested: f64,
    committed_sales: f64,
    selected_tran_nos: Option<&[i32]>,
    pending: &[PendingTransaction],
) -> Result<CommittedPlan, TransferError> {
    if exceeds_available(requested, committed_sales) {
        return Err(TransferError::InsufficientCommitted {
            requested,
            committed: committed_sales,
        });
    }

    if quantities_equal(requested, committed_sales) {
        return Ok(CommittedPlan::ConsumeAll);
    }

    // Partial consumption: the caller must name the exact pending rows.
    let selected = match selected_tran_nos {
        Some(ids) if !ids.is_empty() => ids,
        _ => {
            return Err(TransferError::SelectionMismatch {
                selected_total: 0.0,
                requested,
            })
        }
    };

    let mut chosen: Vec<i32> = Vec::with_capacity(selected.len());
    let mut total = 0.0;
    for &id in selected {
        if chosen.contains(&id) {
            continue;
        }
        match pending.iter().find(|p| p.lot_tran_no == id) {
            Some(row) => {
                total += row.qty;
                chosen.push(id);
            }
            None => {
                return Err(TransferError::SelectionMismatch {
                    selected_total: total,
                    requested,
                })
            }
        }
    }

    if !quantities_equal(total, requested) {
        return Err(TransferError::SelectionMismatch {
            selected_total: total,
            requested,
        });
    }

    Ok(CommittedPlan::ConsumeSubset(chosen))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(lot_tran_no: i32, qty: f64) -> PendingTransaction {
        PendingTransaction {
            lot_tran_no,
            lot_no: "2600107-1".to_string(),
            bin_no: "K0802-4B".to_string(),
            doc_no: "SO-1001".to_string(),
            line_no: Some(1),
            qty,
            transaction_type: 3,
            type_name: transaction_type_name(3).to_string(),
            transaction_date: "2026-07-01 08:00:00".to_string(),
            status: "N".to_string(),
        }
    }

    #[test]
    fn quantity_tolerance_boundaries() {
        assert!(quantities_equal(925.0, 925.0));
        assert!(quantities_equal(925.0, 925.0001));
        assert!(!quantities_equal(925.0, 925.01));

        // Exactly available succeeds, a hundredth over fails, a float hair
        // over stays within tolerance.
        assert!(!exceeds_available(925.0, 925.0));
        assert!(!exceeds_available(925.0001, 925.0));
        assert!(exceeds_available(925.01, 925.0));
    }

    #[test]
    fn transfer_qty_must_be_positive() {
        assert!(validate_transfer_qty(0.0).is_err());
        assert!(validate_transfer_qty(-5.0).is_err());
        assert!(validate_transfer_qty(f64::NAN).is_err());
        assert!(validate_transfer_qty(500.0).is_ok());
    }

    #[test]
    fn transfer_qty_scale_is_capped_at_three_decimals() {
        assert!(validate_transfer_qty(12.125).is_ok());
        assert!(validate_transfer_qty(0.001).is_ok());
        assert!(validate_transfer_qty(12.1255).is_err());
        assert!(validate_transfer_qty(500.0001).is_err());
    }

    #[test]
    fn document_numbers_use_padded_bt_series() {
        assert_eq!(format_document_no(1), "BT-00000001");
        assert_eq!(format_document_no(4217), "BT-00004217");
        assert_eq!(format_document_no(99_999_999), "BT-99999999");
    }

    #[test]
    fn lot_status_combination() {
        assert_eq!(combine_lot_status("B", None), "B");
        assert_eq!(combine_lot_status("B", Some("B")), "B");
        assert_eq!(combine_lot_status("B", Some("")), "B");
        assert_eq!(combine_lot_status("B", Some("C")), "B - C");
    }

    #[test]
    fn parameter_flags() {
        assert!(flag_set("Y"));
        assert!(flag_set("1"));
        assert!(flag_set(" true "));
        assert!(!flag_set("N"));
        assert!(!flag_set(""));

        assert!(is_serial_lot_tracked("L"));
        assert!(is_serial_lot_tracked("S"));
        assert!(!is_serial_lot_tracked("N"));
    }

    #[test]
    fn user_id_truncated_to_legacy_width() {
        assert_eq!(truncate_user_id("DECHAWAT"), "DECHAWAT");
        assert_eq!(truncate_user_id("DECHAWATS"), "DECHAWAT");
        assert_eq!(truncate_user_id("JOE"), "JOE");
    }

    #[test]
    fn committed_plan_rejects_over_commitment() {
        let rows = [pending(1, 50.0)];
        let err = plan_committed_consumption(80.0, 50.0, None, &rows).unwrap_err();
        match err {
            TransferError::InsufficientCommitted { requested, committed } => {
                assert_eq!(requested, 80.0);
                assert_eq!(committed, 50.0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn committed_plan_full_consume_needs_no_selection() {
        let rows = [pending(1, 50.0)];
        let plan = plan_committed_consumption(50.0, 50.0, None, &rows).unwrap();
        assert_eq!(plan, CommittedPlan::ConsumeAll);

        // Within tolerance still counts as a full consume.
        let plan = plan_committed_consumption(50.0001, 50.0, None, &rows).unwrap();
        assert_eq!(plan, CommittedPlan::ConsumeAll);
    }

    #[test]
    fn committed_plan_subset_must_sum_exactly() {
        let rows = [pending(1, 30.0), pending(2, 30.0), pending(3, 20.0)];

        let plan = plan_committed_consumption(60.0, 80.0, Some(&[1, 2]), &rows).unwrap();
        assert_eq!(plan, CommittedPlan::ConsumeSubset(vec![1, 2]));

        // A selection that sums short of the request is a mismatch.
        let err = plan_committed_consumption(60.0, 80.0, Some(&[1, 3]), &rows).unwrap_err();
        match err {
            TransferError::SelectionMismatch { selected_total, requested } => {
                assert_eq!(selected_total, 50.0);
                assert_eq!(requested, 60.0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn committed_plan_partial_without_selection_is_a_mismatch() {
        let rows = [pending(1, 30.0), pending(2, 30.0), pending(3, 20.0)];
        let err = plan_committed_consumption(60.0, 80.0, None, &rows).unwrap_err();
        assert!(matches!(err, TransferError::SelectionMismatch { .. }));

        let err = plan_committed_consumption(60.0, 80.0, Some(&[]), &rows).unwrap_err();
        assert!(matches!(err, TransferError::SelectionMismatch { .. }));
    }

    #[test]
    fn committed_plan_rejects_unknown_tran_no() {
        let rows = [pending(1, 30.0), pending(2, 30.0)];
        let err = plan_committed_consumption(60.0, 80.0, Some(&[1, 99]), &rows).unwrap_err();
        assert!(matches!(err, TransferError::SelectionMismatch { .. }));
    }

    #[test]
    fn committed_plan_ignores_duplicate_selection_ids() {
        let rows = [pending(1, 30.0), pending(2, 30.0)];
        let err = plan_committed_consumption(60.0, 80.0, Some(&[1, 1]), &rows).unwrap_err();
        assert!(matches!(
            err,
            TransferError::SelectionMismatch { selected_total, .. } if selected_total == 30.0
        ));
    }

    #[test]
    fn error_kinds_match_wire_contract() {
        let cases: Vec<(TransferError, &str)> = vec![
            (
                TransferError::LotNotFound { lot_no: "L".into(), bin_no: "B".into() },
                "LotNotFound",
            ),
            (
                TransferError::InvalidBin { bin_no: "B".into(), location: "TFC1".into() },
                "InvalidBin",
            ),
            (
                TransferError::InsufficientQuantity { requested: 950.0, available: 925.0 },
                "InsufficientQuantity",
            ),
            (
                TransferError::InsufficientCommitted { requested: 80.0, committed: 50.0 },
                "InsufficientCommitted",
            ),
            (
                TransferError::SelectionMismatch { selected_total: 50.0, requested: 60.0 },
                "SelectionMismatch",
            ),
            (TransferError::InventoryFrozen, "InventoryFrozen"),
            (
                TransferError::PhysicalCountInProgress {
                    item_key: "I".into(),
                    location: "TFC1".into(),
                },
                "PhysicalCountInProgress",
            ),
            (TransferError::NotTransferrable { item_key: "I".into() }, "NotTransferrable"),
            (TransferError::Unauthorized, "Unauthorized"),
            (TransferError::Contention("lock".into()), "Contention"),
            (TransferError::Timeout("stmt".into()), "Timeout"),
            (TransferError::InvariantViolation("neg".into()), "InvariantViolation"),
            (TransferError::ValidationError("qty".into()), "ValidationError"),
            (TransferError::DatabaseError("db".into()), "SystemError"),
            (TransferError::TransactionError("tx".into()), "SystemError"),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind);
        }
    }

    #[test]
    fn only_concurrency_errors_are_retryable() {
        assert!(TransferError::Contention("x".into()).is_retryable());
        assert!(TransferError::Timeout("x".into()).is_retryable());
        assert!(!TransferError::InventoryFrozen.is_retryable());
        assert!(!TransferError::DatabaseError("x".into()).is_retryable());
    }

    #[test]
    fn audit_legs_carry_legacy_transaction_types() {
        let issue = AuditLeg::Issue { doc_no: "BT-00000001".into(), line_no: 1, qty_issued: 500.0 };
        let receipt =
            AuditLeg::Receipt { doc_no: "BT-00000001".into(), line_no: 1, qty_received: 500.0 };
        assert_eq!(issue.transaction_type(), 9);
        assert_eq!(receipt.transaction_type(), 8);
    }
}
