use crate::database::transfer_db::{TransferDatabase, TransferOutcome};
use crate::database::Database;
use crate::models::transfer_models::{
    combine_lot_status, validate_transfer_qty, AvailabilityView, BinValidationResult,
    CommittedTransferRequest, PendingTransaction, RemarkOption, TransferError, TransferReceipt,
    TransferRequest, TransferResult,
};
use crate::utils::{bangkok_now_rfc3339, receipt_date};

/// Transfer engine facade. Normalizes and validates the wire request, runs
/// the transactional path through the store gateway, and projects the
/// printable receipt.
pub struct TransferService {
    db: TransferDatabase,
}

impl TransferService {
    pub fn new(database: Database) -> Self {
        Self { db: TransferDatabase::new(database) }
    }

    /// Availability snapshot for a lot in one bin.
    pub async fn search_availability(
        &self,
        item_key: &str,
        location: &str,
        lot_no: &str,
        bin_no: &str,
    ) -> Result<AvailabilityView, TransferError> {
        self.db
            .fetch_availability(item_key.trim(), location.trim(), lot_no.trim(), bin_no.trim())
            .await
    }

    /// Validate a destination bin against the bin master.
    pub async fn validate_bin(
        &self,
        location: &str,
        bin_no: &str,
    ) -> Result<BinValidationResult, TransferError> {
        let location = location.trim();
        let bin_no = bin_no.trim();

        if bin_no.is_empty() {
            return Ok(BinValidationResult {
                is_valid: false,
                bin_no: bin_no.to_string(),
                location: location.to_string(),
                message: "Bin number must not be blank".to_string(),
            });
        }

        self.db.validate_bin_location(location, bin_no).await
    }

    /// Active transfer remark options.
    pub async fn list_remarks(&self) -> Result<Vec<RemarkOption>, TransferError> {
        self.db.list_remarks().await
    }

    /// Pending outbound transactions for a lot and bin.
    pub async fn list_pending(
        &self,
        lot_no: &str,
        bin_no: &str,
    ) -> Result<Vec<PendingTransaction>, TransferError> {
        self.db.list_pending_for_lot_bin(lot_no.trim(), bin_no.trim()).await
    }

    /// Free-quantity transfer.
    pub async fn execute_transfer(
        &self,
        request: TransferRequest,
    ) -> Result<TransferResult, TransferError> {
        let request = normalize_transfer_request(request)?;
        let outcome = self.db.execute_transfer(&request).await?;
        Ok(build_transfer_result(
            &request.lot_no,
            &request.item_key,
            &request.location,
            &request.bin_from,
            &request.bin_to,
            request.transfer_qty,
            request.remarks.as_deref().unwrap_or(""),
            request.referenced.as_deref().unwrap_or(""),
            &outcome,
        ))
    }

    /// Committed-quantity transfer.
    pub async fn execute_committed_transfer(
        &self,
        request: CommittedTransferRequest,
    ) -> Result<TransferResult, TransferError> {
        let request = normalize_committed_request(request)?;
        let outcome = self.db.execute_committed_transfer(&request).await?;
        Ok(build_transfer_result(
            &request.lot_no,
            &request.item_key,
            &request.location,
            &request.bin_from,
            &request.bin_to,
            request.transfer_qty,
            request.remarks.as_deref().unwrap_or(""),
            request.referenced.as_deref().unwrap_or(""),
            &outcome,
        ))
    }
}

fn trimmed(value: &str) -> String {
    value.trim().to_string()
}

fn trimmed_opt(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Shared shape validation for both transfer paths. The destination-bin
/// check runs first so it wins over every downstream precondition.
fn validate_shape(
    lot_no: &str,
    item_key: &str,
    location: &str,
    bin_from: &str,
    bin_to: &str,
    transfer_qty: f64,
    user_id: &str,
) -> Result<(), TransferError> {
    if bin_to.is_empty() || bin_to == bin_from {
        return Err(TransferError::InvalidBin {
            bin_no: bin_to.to_string(),
            location: location.to_string(),
        });
    }
    if bin_from.is_empty() {
        return Err(TransferError::InvalidBin {
            bin_no: bin_from.to_string(),
            location: location.to_string(),
        });
    }
    if lot_no.is_empty() || item_key.is_empty() || location.is_empty() {
        return Err(TransferError::ValidationError(
            "Lot number, item key and location are required".to_string(),
        ));
    }
    if user_id.is_empty() {
        return Err(TransferError::Unauthorized);
    }
    validate_transfer_qty(transfer_qty)
}

fn normalize_transfer_request(
    request: TransferRequest,
) -> Result<TransferRequest, TransferError> {
    let request = TransferRequest {
        lot_no: trimmed(&request.lot_no),
        item_key: trimmed(&request.item_key),
        location: trimmed(&request.location),
        bin_from: trimmed(&request.bin_from),
        bin_to: trimmed(&request.bin_to),
        transfer_qty: request.transfer_qty,
        user_id: trimmed(&request.user_id),
        remarks: trimmed_opt(request.remarks),
        referenced: trimmed_opt(request.referenced),
    };
    validate_shape(
        &request.lot_no,
        &request.item_key,
        &request.location,
        &request.bin_from,
        &request.bin_to,
        request.transfer_qty,
        &request.user_id,
    )?;
    Ok(request)
}

fn normalize_committed_request(
    request: CommittedTransferRequest,
) -> Result<CommittedTransferRequest, TransferError> {
    let request = CommittedTransferRequest {
        lot_no: trimmed(&request.lot_no),
        item_key: trimmed(&request.item_key),
        location: trimmed(&request.location),
        bin_from: trimmed(&request.bin_from),
        bin_to: trimmed(&request.bin_to),
        transfer_qty: request.transfer_qty,
        user_id: trimmed(&request.user_id),
        selected_tran_nos: request.selected_tran_nos,
        remarks: trimmed_opt(request.remarks),
        referenced: trimmed_opt(request.referenced),
    };
    validate_shape(
        &request.lot_no,
        &request.item_key,
        &request.location,
        &request.bin_from,
        &request.bin_to,
        request.transfer_qty,
        &request.user_id,
    )?;
    Ok(request)
}

/// Assemble the success payload from the committed transaction outcome.
#[allow(clippy::too_many_arguments)]
fn build_transfer_result(
    lot_no: &str,
    item_key: &str,
    location: &str,
    bin_from: &str,
    bin_to: &str,
    transfer_qty: f64,
    remarks: &str,
    referenced: &str,
    outcome: &TransferOutcome,
) -> TransferResult {
    let source_status = outcome.source_lot_status.clone();
    let destination_status = outcome
        .destination_lot_status
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(&source_status)
        .to_string();

    let receipt = project_receipt(
        lot_no, item_key, location, bin_from, bin_to, transfer_qty, remarks, referenced, outcome,
    );

    TransferResult {
        success: true,
        document_no: outcome.document_no.clone(),
        message: format!(
            "Transferred {transfer_qty:.3} of lot {lot_no} from {bin_from} to {bin_to}"
        ),
        timestamp: bangkok_now_rfc3339(),
        source_lot_status: source_status,
        destination_lot_status: destination_status,
        receipt,
    }
}

/// Pure projection of a successful transfer into the printable receipt
/// record. Rendering and printing are the caller's concern.
#[allow(clippy::too_many_arguments)]
fn project_receipt(
    lot_no: &str,
    item_key: &str,
    location: &str,
    bin_from: &str,
    bin_to: &str,
    transfer_qty: f64,
    remarks: &str,
    referenced: &str,
    outcome: &TransferOutcome,
) -> TransferReceipt {
    TransferReceipt {
        document_no: outcome.document_no.clone(),
        item_key: item_key.to_string(),
        location: location.to_string(),
        bin_from: bin_from.to_string(),
        bin_to: bin_to.to_string(),
        lot_no: lot_no.to_string(),
        qty_on_hand: outcome.qty_on_hand_before,
        transfer_qty: format!("{transfer_qty:.3}"),
        lot_status: combine_lot_status(
            &outcome.source_lot_status,
            outcome.destination_lot_status.as_deref(),
        ),
        date: receipt_date(&outcome.recorded_at),
        remarks: remarks.to_string(),
        referenced: referenced.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn request() -> TransferRequest {
        TransferRequest {
            lot_no: " 2600107-1 ".to_string(),
            item_key: "INBC1403".to_string(),
            location: "TFC1".to_string(),
            bin_from: "K0802-4B".to_string(),
            bin_to: " WHKON1 ".to_string(),
            transfer_qty: 500.0,
            user_id: " DECHAWAT ".to_string(),
            remarks: Some("  ".to_string()),
            referenced: Some(" PO-445 ".to_string()),
        }
    }

    fn outcome() -> TransferOutcome {
        TransferOutcome {
            document_no: "BT-00004217".to_string(),
            source_lot_status: "B".to_string(),
            destination_lot_status: None,
            qty_on_hand_before: 975.0,
            recorded_at: NaiveDate::from_ymd_opt(2026, 7, 28)
                .unwrap()
                .and_hms_opt(10, 30, 0)
                .unwrap(),
        }
    }

    #[test]
    fn normalization_trims_every_string_field() {
        let normalized = normalize_transfer_request(request()).unwrap();
        assert_eq!(normalized.lot_no, "2600107-1");
        assert_eq!(normalized.bin_to, "WHKON1");
        assert_eq!(normalized.user_id, "DECHAWAT");
        assert_eq!(normalized.remarks, None);
        assert_eq!(normalized.referenced, Some("PO-445".to_string()));
    }

    #[test]
    fn destination_bin_equal_to_source_is_invalid() {
        let mut req = request();
        req.bin_to = "K0802-4B".to_string();
        let err = normalize_transfer_request(req).unwrap_err();
        assert!(matches!(err, TransferError::InvalidBin { .. }));
    }

    #[test]
    fn blank_destination_bin_is_invalid_even_after_trim() {
        let mut req = request();
        req.bin_to = "   ".to_string();
        let err = normalize_transfer_request(req).unwrap_err();
        assert!(matches!(err, TransferError::InvalidBin { .. }));
    }

    #[test]
    fn blank_user_id_is_unauthorized() {
        let mut req = request();
        req.user_id = "  ".to_string();
        let err = normalize_transfer_request(req).unwrap_err();
        assert!(matches!(err, TransferError::Unauthorized));
    }

    #[test]
    fn zero_and_overscaled_quantities_are_rejected() {
        let mut req = request();
        req.transfer_qty = 0.0;
        assert!(matches!(
            normalize_transfer_request(req).unwrap_err(),
            TransferError::ValidationError(_)
        ));

        let mut req = request();
        req.transfer_qty = 500.0001;
        assert!(matches!(
            normalize_transfer_request(req).unwrap_err(),
            TransferError::ValidationError(_)
        ));
    }

    #[test]
    fn committed_request_shares_the_shape_checks() {
        let req = CommittedTransferRequest {
            lot_no: "2600107-1".to_string(),
            item_key: "INBC1403".to_string(),
            location: "TFC1".to_string(),
            bin_from: "K0802-4B".to_string(),
            bin_to: "K0802-4B".to_string(),
            transfer_qty: 50.0,
            user_id: "DECHAWAT".to_string(),
            selected_tran_nos: None,
            remarks: None,
            referenced: None,
        };
        let err = normalize_committed_request(req).unwrap_err();
        assert!(matches!(err, TransferError::InvalidBin { .. }));
    }

    #[test]
    fn receipt_carries_document_quantities_and_formatted_date() {
        let receipt = project_receipt(
            "2600107-1",
            "INBC1403",
            "TFC1",
            "K0802-4B",
            "WHKON1",
            500.0,
            "Restock",
            "PO-445",
            &outcome(),
        );
        assert_eq!(receipt.document_no, "BT-00004217");
        assert_eq!(receipt.qty_on_hand, 975.0);
        assert_eq!(receipt.transfer_qty, "500.000");
        assert_eq!(receipt.lot_status, "B");
        assert_eq!(receipt.date, "28-07-26");
        assert_eq!(receipt.remarks, "Restock");
    }

    #[test]
    fn receipt_shows_both_statuses_when_destination_differs() {
        let mut out = outcome();
        out.destination_lot_status = Some("C".to_string());
        let receipt =
            project_receipt("2600107-1", "INBC1403", "TFC1", "K0802-4B", "WHKON1", 500.0, "", "", &out);
        assert_eq!(receipt.lot_status, "B - C");
    }

    #[test]
    fn result_falls_back_to_source_status_when_destination_row_is_absent() {
        let result = build_transfer_result(
            "2600107-1",
            "INBC1403",
            "TFC1",
            "K0802-4B",
            "WHKON1",
            500.0,
            "",
            "",
            &outcome(),
        );
        assert!(result.success);
        assert_eq!(result.document_no, "BT-00004217");
        assert_eq!(result.source_lot_status, "B");
        assert_eq!(result.destination_lot_status, "B");
        assert!(result.message.contains("500.000"));
    }
}
