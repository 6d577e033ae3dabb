use chrono::NaiveDateTime;
use tracing::info;

use crate::constants::{DOCUMENT_SERIES, LOCK_WAIT_TIMEOUT_MS, QUANTITY_TOLERANCE};
use crate::database::{Database, SqlClient};
use crate::models::transfer_models::{
    flag_set, format_document_no, is_serial_lot_tracked, plan_committed_consumption,
    transaction_type_name, truncate_user_id, AuditContext, AuditLeg, AvailabilityView,
    BinValidationResult, CommittedTransferRequest, LockedLot, PendingTransaction, RemarkOption,
    TransferError, TransferRequest,
};
use crate::utils::bangkok_now;

/// Result of a committed transfer transaction, before receipt projection.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub document_no: String,
    pub source_lot_status: String,
    /// Status of an already-existing destination lot row, if any. The engine
    /// never creates the destination row; the batch job owns that.
    pub destination_lot_status: Option<String>,
    pub qty_on_hand_before: f64,
    pub recorded_at: NaiveDateTime,
}

/// Typed gateway over the legacy inventory tables. Every mutation runs inside
/// an explicit transaction holding `UPDLOCK, ROWLOCK` on the source lot row.
pub struct TransferDatabase {
    db: Database,
}

impl TransferDatabase {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Availability snapshot for a lot in one bin. Single statement, so the
    /// row figures and the pending-commitment sum come from one consistent
    /// read. Writers must re-read under an update lock instead.
    pub async fn fetch_availability(
        &self,
        item_key: &str,
        location: &str,
        lot_no: &str,
        bin_no: &str,
    ) -> Result<AvailabilityView, TransferError> {
        let mut client = self
            .db
            .get_client()
            .await
            .map_err(|e| TransferError::DatabaseError(e.to_string()))?;

        let types = pending_types_sql();
        let query = format!(
            r#"
            SELECT l.QtyOnHand, l.QtyCommitSales,
                   (
                       SELECT COALESCE(SUM(p.Qty), 0.0)
                       FROM (
                           SELECT QtyIssued AS Qty FROM LotTransaction
                           WHERE Processed IN ('N','P')
                             AND TransactionType IN ({types})
                             AND LotNo = @P1 AND ItemKey = @P2 AND LocationKey = @P3 AND BinNo = @P4
                           UNION ALL
                           SELECT QtyIssued AS Qty FROM QCLotTransaction
                           WHERE Processed IN ('N','P')
                             AND TransactionType IN ({types})
                             AND LotNo = @P1 AND ItemKey = @P2 AND LocationKey = @P3 AND BinNo = @P4
                       ) p
                   ) AS PendingCommit
            FROM LotMaster l
            WHERE l.LotNo = @P1 AND l.ItemKey = @P2 AND l.LocationKey = @P3 AND l.BinNo = @P4
        "#
        );

        let row = client
            .query(query, &[&lot_no, &item_key, &location, &bin_no])
            .await
            .map_err(|e| classify_db_error(e, "fetch availability"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "fetch availability"))?
            .ok_or_else(|| TransferError::LotNotFound {
                lot_no: lot_no.to_string(),
                bin_no: bin_no.to_string(),
            })?;

        let on_hand: f64 = row.get("QtyOnHand").unwrap_or(0.0);
        let committed_sales: f64 = row.get("QtyCommitSales").unwrap_or(0.0);
        let pending_commit: f64 = row.get("PendingCommit").unwrap_or(0.0);
        let available = on_hand - committed_sales;

        if available < -QUANTITY_TOLERANCE {
            return Err(TransferError::InvariantViolation(format!(
                "lot {lot_no} bin {bin_no}: on-hand {on_hand} below committed {committed_sales}"
            )));
        }

        Ok(AvailabilityView {
            lot_no: lot_no.to_string(),
            item_key: item_key.to_string(),
            location: location.to_string(),
            bin_no: bin_no.to_string(),
            on_hand,
            committed_sales,
            available,
            pending_commit,
        })
    }

    /// Validate that a bin exists in the location's bin master.
    pub async fn validate_bin_location(
        &self,
        location: &str,
        bin_no: &str,
    ) -> Result<BinValidationResult, TransferError> {
        let mut client = self
            .db
            .get_client()
            .await
            .map_err(|e| TransferError::DatabaseError(e.to_string()))?;

        let query = r#"
            SELECT COUNT(*) as count
            FROM BINMaster WITH (NOLOCK)
            WHERE Location = @P1 AND BinNo = @P2
        "#;

        let row = client
            .query(query, &[&location, &bin_no])
            .await
            .map_err(|e| classify_db_error(e, "validate bin"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "validate bin"))?;

        let is_valid = row.map(|r| r.get::<i32, _>("count").unwrap_or(0) > 0).unwrap_or(false);
        let message = if is_valid {
            format!("Bin '{bin_no}' is valid in location '{location}'")
        } else {
            format!("Bin '{bin_no}' does not exist in location '{location}'")
        };

        Ok(BinValidationResult {
            is_valid,
            bin_no: bin_no.to_string(),
            location: location.to_string(),
            message,
        })
    }

    /// All active transfer remark options, ordered for the dropdown.
    pub async fn list_remarks(&self) -> Result<Vec<RemarkOption>, TransferError> {
        let mut client = self
            .db
            .get_client()
            .await
            .map_err(|e| TransferError::DatabaseError(e.to_string()))?;

        let query = r#"
            SELECT id, remark_name
            FROM dbo.bintransferlist WITH (NOLOCK)
            WHERE is_active = 1
            ORDER BY id
        "#;

        let rows = client
            .query(query, &[])
            .await
            .map_err(|e| classify_db_error(e, "list remarks"))?
            .into_first_result()
            .await
            .map_err(|e| classify_db_error(e, "list remarks"))?;

        Ok(rows
            .into_iter()
            .map(|row| RemarkOption {
                id: row.get::<i32, _>("id").unwrap_or(0),
                name: row.get::<&str, _>("remark_name").unwrap_or("").to_string(),
            })
            .collect())
    }

    /// Pending outbound transactions for a lot and bin, newest first.
    pub async fn list_pending_for_lot_bin(
        &self,
        lot_no: &str,
        bin_no: &str,
    ) -> Result<Vec<PendingTransaction>, TransferError> {
        let mut client = self
            .db
            .get_client()
            .await
            .map_err(|e| TransferError::DatabaseError(e.to_string()))?;

        Self::query_pending(&mut client, lot_no, bin_no).await
    }

    /// Execute a free-quantity transfer: reserve `qty` on the source row's
    /// commitment and write the paired audit rows under a fresh BT document.
    /// On-hand is untouched; the overnight batch job posts it from the audit
    /// trail.
    pub async fn execute_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferOutcome, TransferError> {
        let mut client = self
            .db
            .get_client()
            .await
            .map_err(|e| TransferError::DatabaseError(e.to_string()))?;

        Self::begin_transfer_transaction(&mut client).await?;

        let result = Self::run_transfer(&mut client, request).await;

        match result {
            Ok(outcome) => {
                client
                    .simple_query("COMMIT")
                    .await
                    .map_err(|e| classify_db_error(e, "commit transfer"))?;
                info!(
                    document_no = %outcome.document_no,
                    lot_no = %request.lot_no,
                    bin_from = %request.bin_from,
                    bin_to = %request.bin_to,
                    qty = request.transfer_qty,
                    "✅ Bin transfer committed"
                );
                Ok(outcome)
            }
            Err(e) => {
                let _ = client.simple_query("ROLLBACK").await;
                Err(e)
            }
        }
    }

    /// Execute a committed-quantity transfer: release `qty` from the source
    /// commitment (full commitment, or an explicit subset of pending rows)
    /// and write the same paired audit rows. The original pending rows are
    /// left untouched; re-homing is expressed by the new pair plus the
    /// commitment delta.
    pub async fn execute_committed_transfer(
        &self,
        request: &CommittedTransferRequest,
    ) -> Result<TransferOutcome, TransferError> {
        let mut client = self
            .db
            .get_client()
            .await
            .map_err(|e| TransferError::DatabaseError(e.to_string()))?;

        Self::begin_transfer_transaction(&mut client).await?;

        let result = Self::run_committed_transfer(&mut client, request).await;

        match result {
            Ok(outcome) => {
                client
                    .simple_query("COMMIT")
                    .await
                    .map_err(|e| classify_db_error(e, "commit committed transfer"))?;
                info!(
                    document_no = %outcome.document_no,
                    lot_no = %request.lot_no,
                    bin_from = %request.bin_from,
                    bin_to = %request.bin_to,
                    qty = request.transfer_qty,
                    "✅ Committed bin transfer committed"
                );
                Ok(outcome)
            }
            Err(e) => {
                let _ = client.simple_query("ROLLBACK").await;
                Err(e)
            }
        }
    }

    // Transaction body for the free-quantity path.
    async fn run_transfer(
        client: &mut SqlClient,
        request: &TransferRequest,
    ) -> Result<TransferOutcome, TransferError> {
        let now = bangkok_now().naive_local();
        let user_id = truncate_user_id(&request.user_id);

        // 1. System preconditions, first failure wins.
        Self::gate_preconditions(
            client,
            &request.item_key,
            &request.location,
            &request.bin_to,
        )
        .await?;

        // 2. Lock and re-read the source lot row; availability must come from
        //    the same snapshot the commitment update will write against.
        let lot = Self::lock_source_lot(
            client,
            &request.lot_no,
            &request.item_key,
            &request.location,
            &request.bin_from,
        )
        .await?;

        let available = lot.qty_on_hand - lot.qty_commit_sales;
        if available < -QUANTITY_TOLERANCE {
            return Err(TransferError::InvariantViolation(format!(
                "lot {} bin {}: on-hand {} below committed {}",
                request.lot_no, request.bin_from, lot.qty_on_hand, lot.qty_commit_sales
            )));
        }
        if request.transfer_qty > available + QUANTITY_TOLERANCE {
            return Err(TransferError::InsufficientQuantity {
                requested: request.transfer_qty,
                available,
            });
        }

        // 3. Allocate the document number late, holding the counter row for
        //    the minimum duration before the audit writes.
        let sequence = Self::next_document_number(client).await?;
        let document_no = format_document_no(sequence);

        // 4. Inventory journal header for the document.
        let (in_acct, std_cost) =
            Self::fetch_gl_context(client, &request.item_key, &request.location).await?;
        Self::insert_journal_header(
            client,
            &request.item_key,
            &request.location,
            &document_no,
            &in_acct,
            std_cost,
            user_id,
            &now,
        )
        .await?;

        // 5. Reserve the quantity on the source commitment.
        let reserve_query = r#"
            UPDATE LotMaster
            SET QtyCommitSales = QtyCommitSales + @P1,
                DocumentNo = @P2, TransactionType = @P3,
                RecUserId = @P4, Recdate = @P5
            WHERE LotNo = @P6 AND ItemKey = @P7 AND LocationKey = @P8 AND BinNo = @P9
        "#;
        client
            .execute(
                reserve_query,
                &[
                    &request.transfer_qty,
                    &document_no,
                    &crate::constants::TRAN_TYPE_ISSUE,
                    &user_id,
                    &now,
                    &request.lot_no,
                    &request.item_key,
                    &request.location,
                    &request.bin_from,
                ],
            )
            .await
            .map_err(|e| classify_db_error(e, "reserve source commitment"))?;

        // 6. Destination row status, if the row already exists. Creation or
        //    increment of a missing destination row is the batch job's call.
        let destination_lot_status = Self::destination_lot_status(
            client,
            &request.lot_no,
            &request.item_key,
            &request.location,
            &request.bin_to,
        )
        .await?;

        // 7-8. Paired audit rows under the same document number.
        let context = AuditContext {
            lot_no: request.lot_no.clone(),
            item_key: request.item_key.clone(),
            location: request.location.clone(),
            bin_no: request.bin_from.clone(),
            vendor_key: lot.vendor_key.clone(),
            vendor_lot_no: lot.vendor_lot_no.clone(),
            date_received: lot.date_received,
            date_expiry: lot.date_expiry,
            user_id: user_id.to_string(),
            recorded_at: now,
        };

        let issue_tran_no = Self::insert_audit_row(
            client,
            &context,
            &AuditLeg::Issue {
                doc_no: document_no.clone(),
                line_no: 1,
                qty_issued: request.transfer_qty,
            },
        )
        .await?;

        let receipt_context = AuditContext { bin_no: request.bin_to.clone(), ..context };
        Self::insert_audit_row(
            client,
            &receipt_context,
            &AuditLeg::Receipt {
                doc_no: document_no.clone(),
                line_no: 1,
                qty_received: request.transfer_qty,
            },
        )
        .await?;

        // 9. Transfer document row carrying the remark and reference.
        Self::insert_transfer_document(
            client,
            request,
            issue_tran_no.unwrap_or(0),
            lot.qty_on_hand,
            user_id,
            &now,
        )
        .await?;

        Ok(TransferOutcome {
            document_no,
            source_lot_status: lot.lot_status,
            destination_lot_status,
            qty_on_hand_before: lot.qty_on_hand,
            recorded_at: now,
        })
    }

    // Transaction body for the committed-quantity path.
    async fn run_committed_transfer(
        client: &mut SqlClient,
        request: &CommittedTransferRequest,
    ) -> Result<TransferOutcome, TransferError> {
        let now = bangkok_now().naive_local();
        let user_id = truncate_user_id(&request.user_id);

        Self::gate_preconditions(
            client,
            &request.item_key,
            &request.location,
            &request.bin_to,
        )
        .await?;

        let lot = Self::lock_source_lot(
            client,
            &request.lot_no,
            &request.item_key,
            &request.location,
            &request.bin_from,
        )
        .await?;

        // Triage against the locked commitment figure, then resolve the
        // consumption plan against the pending rows on the source bin.
        let pending = Self::query_pending(client, &request.lot_no, &request.bin_from).await?;
        plan_committed_consumption(
            request.transfer_qty,
            lot.qty_commit_sales,
            request.selected_tran_nos.as_deref(),
            &pending,
        )?;

        let sequence = Self::next_document_number(client).await?;
        let document_no = format_document_no(sequence);

        let (in_acct, std_cost) =
            Self::fetch_gl_context(client, &request.item_key, &request.location).await?;
        Self::insert_journal_header(
            client,
            &request.item_key,
            &request.location,
            &document_no,
            &in_acct,
            std_cost,
            user_id,
            &now,
        )
        .await?;

        // Release the reservation; it is being re-homed to the destination
        // bin. The floor keeps float dust out of the commitment column.
        let new_commit = (lot.qty_commit_sales - request.transfer_qty).max(0.0);
        let release_query = r#"
            UPDATE LotMaster
            SET QtyCommitSales = @P1,
                DocumentNo = @P2, TransactionType = @P3,
                RecUserId = @P4, Recdate = @P5
            WHERE LotNo = @P6 AND ItemKey = @P7 AND LocationKey = @P8 AND BinNo = @P9
        "#;
        client
            .execute(
                release_query,
                &[
                    &new_commit,
                    &document_no,
                    &crate::constants::TRAN_TYPE_ISSUE,
                    &user_id,
                    &now,
                    &request.lot_no,
                    &request.item_key,
                    &request.location,
                    &request.bin_from,
                ],
            )
            .await
            .map_err(|e| classify_db_error(e, "release source commitment"))?;

        let destination_lot_status = Self::destination_lot_status(
            client,
            &request.lot_no,
            &request.item_key,
            &request.location,
            &request.bin_to,
        )
        .await?;

        // The original pending rows stay untouched; only the new pair and the
        // commitment delta express the movement.
        let context = AuditContext {
            lot_no: request.lot_no.clone(),
            item_key: request.item_key.clone(),
            location: request.location.clone(),
            bin_no: request.bin_from.clone(),
            vendor_key: lot.vendor_key.clone(),
            vendor_lot_no: lot.vendor_lot_no.clone(),
            date_received: lot.date_received,
            date_expiry: lot.date_expiry,
            user_id: user_id.to_string(),
            recorded_at: now,
        };

        let issue_tran_no = Self::insert_audit_row(
            client,
            &context,
            &AuditLeg::Issue {
                doc_no: document_no.clone(),
                line_no: 1,
                qty_issued: request.transfer_qty,
            },
        )
        .await?;

        let receipt_context = AuditContext { bin_no: request.bin_to.clone(), ..context };
        Self::insert_audit_row(
            client,
            &receipt_context,
            &AuditLeg::Receipt {
                doc_no: document_no.clone(),
                line_no: 1,
                qty_received: request.transfer_qty,
            },
        )
        .await?;

        let document_request = TransferRequest {
            lot_no: request.lot_no.clone(),
            item_key: request.item_key.clone(),
            location: request.location.clone(),
            bin_from: request.bin_from.clone(),
            bin_to: request.bin_to.clone(),
            transfer_qty: request.transfer_qty,
            user_id: request.user_id.clone(),
            remarks: request.remarks.clone(),
            referenced: request.referenced.clone(),
        };
        Self::insert_transfer_document(
            client,
            &document_request,
            issue_tran_no.unwrap_or(0),
            lot.qty_on_hand,
            user_id,
            &now,
        )
        .await?;

        Ok(TransferOutcome {
            document_no,
            source_lot_status: lot.lot_status,
            destination_lot_status,
            qty_on_hand_before: lot.qty_on_hand,
            recorded_at: now,
        })
    }

    /// Open the transfer transaction: repeatable-read isolation so the
    /// availability read and the commitment update see one snapshot, plus the
    /// bounded lock-wait budget.
    async fn begin_transfer_transaction(client: &mut SqlClient) -> Result<(), TransferError> {
        client
            .simple_query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await
            .map_err(|e| classify_db_error(e, "set isolation level"))?;
        client
            .simple_query(&format!("SET LOCK_TIMEOUT {LOCK_WAIT_TIMEOUT_MS}"))
            .await
            .map_err(|e| classify_db_error(e, "set lock timeout"))?;
        client
            .simple_query("BEGIN TRANSACTION")
            .await
            .map_err(|e| classify_db_error(e, "begin transaction"))?;
        Ok(())
    }

    /// Ordered system preconditions. The destination-bin shape check (blank
    /// or equal to source) happens upstream at request normalization; the
    /// source lot existence check is the locking read that follows.
    async fn gate_preconditions(
        client: &mut SqlClient,
        item_key: &str,
        location: &str,
        bin_to: &str,
    ) -> Result<(), TransferError> {
        // Destination bin must exist in the location's bin master.
        let bin_query = "SELECT COUNT(*) as count FROM BINMaster WHERE Location = @P1 AND BinNo = @P2";
        let bin_row = client
            .query(bin_query, &[&location, &bin_to])
            .await
            .map_err(|e| classify_db_error(e, "gate: bin master"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "gate: bin master"))?;
        let bin_exists = bin_row.map(|r| r.get::<i32, _>("count").unwrap_or(0) > 0).unwrap_or(false);
        if !bin_exists {
            return Err(TransferError::InvalidBin {
                bin_no: bin_to.to_string(),
                location: location.to_string(),
            });
        }

        // Inventory freeze parameter.
        let freeze_query = "SELECT ConfigValue FROM Sysconfig WHERE ConfigKey = 'Freeze_Inventory'";
        let freeze_row = client
            .query(freeze_query, &[])
            .await
            .map_err(|e| classify_db_error(e, "gate: freeze parameter"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "gate: freeze parameter"))?;
        if let Some(row) = freeze_row {
            if flag_set(row.get::<&str, _>("ConfigValue").unwrap_or("")) {
                return Err(TransferError::InventoryFrozen);
            }
        }

        // Physical count flag on the item/location row.
        let phy_query = "SELECT Inphyflag FROM INLOC WHERE ItemKey = @P1 AND Location = @P2";
        let phy_row = client
            .query(phy_query, &[&item_key, &location])
            .await
            .map_err(|e| classify_db_error(e, "gate: physical count flag"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "gate: physical count flag"))?;
        if let Some(row) = phy_row {
            if flag_set(row.get::<&str, _>("Inphyflag").unwrap_or("")) {
                return Err(TransferError::PhysicalCountInProgress {
                    item_key: item_key.to_string(),
                    location: location.to_string(),
                });
            }
        }

        // The item must be serial-lot tracked and multi-bin enabled.
        let item_query = "SELECT Serlotflag, Multibinflag FROM INMAST WHERE Itemkey = @P1";
        let item_row = client
            .query(item_query, &[&item_key])
            .await
            .map_err(|e| classify_db_error(e, "gate: item master"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "gate: item master"))?
            .ok_or_else(|| TransferError::NotTransferrable { item_key: item_key.to_string() })?;

        let serlot = item_row.get::<&str, _>("Serlotflag").unwrap_or("");
        let multibin = item_row.get::<&str, _>("Multibinflag").unwrap_or("");
        if !is_serial_lot_tracked(serlot) || !flag_set(multibin) {
            return Err(TransferError::NotTransferrable { item_key: item_key.to_string() });
        }

        Ok(())
    }

    /// Lock the source lot row for update and read the figures the transfer
    /// will be validated and written against.
    async fn lock_source_lot(
        client: &mut SqlClient,
        lot_no: &str,
        item_key: &str,
        location: &str,
        bin_from: &str,
    ) -> Result<LockedLot, TransferError> {
        let query = r#"
            SELECT QtyOnHand, QtyCommitSales, DateReceived, DateExpiry,
                   VendorKey, VendorLotNo, LotStatus
            FROM LotMaster WITH (UPDLOCK, ROWLOCK)
            WHERE LotNo = @P1 AND ItemKey = @P2 AND LocationKey = @P3 AND BinNo = @P4
        "#;

        let row = client
            .query(query, &[&lot_no, &item_key, &location, &bin_from])
            .await
            .map_err(|e| classify_db_error(e, "lock source lot"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "lock source lot"))?
            .ok_or_else(|| TransferError::LotNotFound {
                lot_no: lot_no.to_string(),
                bin_no: bin_from.to_string(),
            })?;

        Ok(LockedLot {
            qty_on_hand: row.get("QtyOnHand").unwrap_or(0.0),
            qty_commit_sales: row.get("QtyCommitSales").unwrap_or(0.0),
            date_received: row
                .get::<NaiveDateTime, _>("DateReceived")
                .unwrap_or_else(|| bangkok_now().naive_local()),
            date_expiry: row.get::<NaiveDateTime, _>("DateExpiry"),
            vendor_key: row.get::<&str, _>("VendorKey").unwrap_or("").to_string(),
            vendor_lot_no: row.get::<&str, _>("VendorLotNo").unwrap_or("").to_string(),
            lot_status: row.get::<&str, _>("LotStatus").unwrap_or("").to_string(),
        })
    }

    /// Allocate the next document number for the BT series under a row lock
    /// held by this transaction. A rollback undoes the bump; gaps only appear
    /// for committed-then-abandoned callers, which cannot happen here.
    async fn next_document_number(client: &mut SqlClient) -> Result<i32, TransferError> {
        let select_query = r#"
            SELECT SeqNum
            FROM Seqnum WITH (UPDLOCK, ROWLOCK)
            WHERE SeqName = @P1
        "#;

        let row = client
            .query(select_query, &[&DOCUMENT_SERIES])
            .await
            .map_err(|e| classify_db_error(e, "lock document sequence"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "lock document sequence"))?
            .ok_or_else(|| {
                TransferError::TransactionError(format!(
                    "Sequence row '{DOCUMENT_SERIES}' not found"
                ))
            })?;

        let current: i32 = row.get("SeqNum").unwrap_or(0);

        client
            .execute("UPDATE Seqnum SET SeqNum = SeqNum + 1 WHERE SeqName = @P1", &[&DOCUMENT_SERIES])
            .await
            .map_err(|e| classify_db_error(e, "increment document sequence"))?;

        Ok(current + 1)
    }

    /// GL account and standard cost for the journal header, from the item's
    /// INLOC inventory class.
    async fn fetch_gl_context(
        client: &mut SqlClient,
        item_key: &str,
        location: &str,
    ) -> Result<(String, f64), TransferError> {
        let query = r#"
            SELECT Inclasskey, Stdcost
            FROM INLOC
            WHERE ItemKey = @P1 AND Location = @P2
        "#;

        let row = client
            .query(query, &[&item_key, &location])
            .await
            .map_err(|e| classify_db_error(e, "fetch INLOC record"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "fetch INLOC record"))?
            .ok_or_else(|| {
                TransferError::DatabaseError(format!(
                    "INLOC record not found for item {item_key} in location {location}"
                ))
            })?;

        let class_key = row.get::<&str, _>("Inclasskey").unwrap_or("").to_string();
        let std_cost = {
            // SQL Server NUMERIC needs special handling in tiberius.
            use tiberius::numeric::Numeric;

            if let Ok(Some(numeric_val)) = row.try_get::<Numeric, _>("Stdcost") {
                numeric_val.value() as f64 / 10_f64.powi(numeric_val.scale() as i32)
            } else {
                match row.try_get::<f64, _>("Stdcost") {
                    Ok(Some(val)) => val,
                    _ => 0.0,
                }
            }
        };

        Ok((inventory_account_for_class(&class_key).to_string(), std_cost))
    }

    /// Inventory journal header for the transfer document. Quantity and
    /// amount stay zero; the document exists so the financial side can see
    /// the movement.
    #[allow(clippy::too_many_arguments)]
    async fn insert_journal_header(
        client: &mut SqlClient,
        item_key: &str,
        location: &str,
        document_no: &str,
        in_acct: &str,
        std_cost: f64,
        user_id: &str,
        now: &NaiveDateTime,
    ) -> Result<(), TransferError> {
        let query = r#"
            INSERT INTO Mintxdh (
                ItemKey, Location, ToLocation, SysID, ProcessID, SysDocID, SysLinSq,
                TrnTyp, TrnSubTyp, DocNo, DocDate, AplDate, TrnDesc, TrnQty, TrnAmt,
                NLAcct, INAcct, CreatedSerlot, RecUserID, RecDate, Updated_FinTable,
                SortField, JrnlBtchNo, StdCost, Stdcostupdated, GLtrnAmt
            ) VALUES (
                @P1, @P2, '', '7', 'M', @P3, 1, 'A', '', @P4, @P5, @P5, 'Bin Transfer', 0, 0.000000,
                '1100', @P6, 'Y', @P7, @P8, 0, '', '', @P9, 0, 0.000000
            )
        "#;

        client
            .execute(
                query,
                &[
                    &item_key,
                    &location,
                    &document_no,
                    &document_no,
                    now,
                    &in_acct,
                    &user_id,
                    now,
                    &std_cost,
                ],
            )
            .await
            .map_err(|e| classify_db_error(e, "insert journal header"))?;

        Ok(())
    }

    /// Write one leg of the paired audit trail. The two legs populate
    /// different document columns, so the variant picks the statement.
    /// Returns the audit row id for the issue leg.
    async fn insert_audit_row(
        client: &mut SqlClient,
        context: &AuditContext,
        leg: &AuditLeg,
    ) -> Result<Option<i32>, TransferError> {
        let transaction_type = leg.transaction_type();

        match leg {
            AuditLeg::Issue { doc_no, line_no, qty_issued } => {
                let query = r#"
                    INSERT INTO LotTransaction (
                        LotNo, ItemKey, LocationKey, DateReceived, DateExpiry,
                        TransactionType, VendorKey, VendorlotNo,
                        IssueDocNo, IssueDocLineNo, IssueDate, QtyIssued,
                        RecUserid, RecDate, Processed, BinNo
                    ) OUTPUT INSERTED.LotTranNo
                    VALUES (
                        @P1, @P2, @P3, @P4, @P5,
                        @P6, @P7, @P8,
                        @P9, @P10, @P11, @P12,
                        @P13, @P14, 'N', @P15
                    )
                "#;

                let row = client
                    .query(
                        query,
                        &[
                            &context.lot_no,
                            &context.item_key,
                            &context.location,
                            &context.date_received,
                            &context.date_expiry,
                            &transaction_type,
                            &context.vendor_key,
                            &context.vendor_lot_no,
                            doc_no,
                            line_no,
                            &context.recorded_at,
                            qty_issued,
                            &context.user_id,
                            &context.recorded_at,
                            &context.bin_no,
                        ],
                    )
                    .await
                    .map_err(|e| classify_db_error(e, "insert issue audit row"))?
                    .into_row()
                    .await
                    .map_err(|e| classify_db_error(e, "insert issue audit row"))?;

                Ok(row.and_then(|r| r.get::<i32, _>("LotTranNo")))
            }
            AuditLeg::Receipt { doc_no, line_no, qty_received } => {
                let query = r#"
                    INSERT INTO LotTransaction (
                        LotNo, ItemKey, LocationKey, DateReceived, DateExpiry,
                        TransactionType, VendorKey, VendorlotNo, CustomerKey,
                        ReceiptDocNo, ReceiptDocLineNo, QtyReceived,
                        RecUserid, RecDate, Processed, BinNo, DateQuarantine
                    ) VALUES (
                        @P1, @P2, @P3, @P4, @P5,
                        @P6, @P7, @P8, '',
                        @P9, @P10, @P11,
                        @P12, @P13, 'N', @P14, NULL
                    )
                "#;

                client
                    .execute(
                        query,
                        &[
                            &context.lot_no,
                            &context.item_key,
                            &context.location,
                            &context.date_received,
                            &context.date_expiry,
                            &transaction_type,
                            &context.vendor_key,
                            &context.vendor_lot_no,
                            doc_no,
                            line_no,
                            qty_received,
                            &context.user_id,
                            &context.recorded_at,
                            &context.bin_no,
                        ],
                    )
                    .await
                    .map_err(|e| classify_db_error(e, "insert receipt audit row"))?;

                Ok(None)
            }
        }
    }

    /// Transfer document row; `User1` carries the remark, `User5` the
    /// reference, per the legacy layout the reprint screen reads.
    async fn insert_transfer_document(
        client: &mut SqlClient,
        request: &TransferRequest,
        issue_tran_no: i32,
        qty_on_hand_before: f64,
        user_id: &str,
        now: &NaiveDateTime,
    ) -> Result<(), TransferError> {
        let query = r#"
            INSERT INTO BinTransfer (
                ItemKey, Location, LotNo, BinNoFrom, BinNoTo,
                LotTranNo, QtyOnHand, TransferQty, InTransID,
                RecUserID, RecDate, ContainerNo, User1, User5
            ) VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8, 0, @P9, @P10, '0', @P11, @P12)
        "#;

        let remarks = request.remarks.clone().unwrap_or_default();
        let referenced = request.referenced.clone().unwrap_or_default();

        client
            .execute(
                query,
                &[
                    &request.item_key,
                    &request.location,
                    &request.lot_no,
                    &request.bin_from,
                    &request.bin_to,
                    &issue_tran_no,
                    &qty_on_hand_before,
                    &request.transfer_qty,
                    &user_id,
                    now,
                    &remarks,
                    &referenced,
                ],
            )
            .await
            .map_err(|e| classify_db_error(e, "insert transfer document"))?;

        Ok(())
    }

    /// Lot status of an existing destination row; `None` when the row does
    /// not exist yet.
    async fn destination_lot_status(
        client: &mut SqlClient,
        lot_no: &str,
        item_key: &str,
        location: &str,
        bin_to: &str,
    ) -> Result<Option<String>, TransferError> {
        let query = r#"
            SELECT LotStatus
            FROM LotMaster
            WHERE LotNo = @P1 AND ItemKey = @P2 AND LocationKey = @P3 AND BinNo = @P4
        "#;

        let row = client
            .query(query, &[&lot_no, &item_key, &location, &bin_to])
            .await
            .map_err(|e| classify_db_error(e, "destination lot status"))?
            .into_row()
            .await
            .map_err(|e| classify_db_error(e, "destination lot status"))?;

        Ok(row.map(|r| r.get::<&str, _>("LotStatus").unwrap_or("").to_string()))
    }

    /// Pending outbound transactions for a lot and bin across the audit and
    /// QC audit streams, newest first.
    async fn query_pending(
        client: &mut SqlClient,
        lot_no: &str,
        bin_no: &str,
    ) -> Result<Vec<PendingTransaction>, TransferError> {
        let types = pending_types_sql();
        let query = format!(
            r#"
            SELECT LotNo, BinNo, IssueDocNo as DocNo, IssueDocLineNo, QtyIssued as Qty,
                   LotTranNo, TransactionType, RecDate, Processed
            FROM LotTransaction
            WHERE Processed IN ('N','P')
              AND TransactionType IN ({types})
              AND LotNo = @P1 AND BinNo = @P2
            UNION ALL
            SELECT LotNo, BinNo, IssueDocNo as DocNo, IssueDocLineNo, QtyIssued as Qty,
                   LotTranNo, TransactionType, RecDate, Processed
            FROM QCLotTransaction
            WHERE Processed IN ('N','P')
              AND TransactionType IN ({types})
              AND LotNo = @P1 AND BinNo = @P2
            ORDER BY RecDate DESC
        "#
        );

        let rows = client
            .query(query, &[&lot_no, &bin_no])
            .await
            .map_err(|e| classify_db_error(e, "query pending transactions"))?
            .into_first_result()
            .await
            .map_err(|e| classify_db_error(e, "query pending transactions"))?;

        let mut transactions = Vec::with_capacity(rows.len());
        for row in rows {
            let transaction_type = row.get::<u8, _>("TransactionType").unwrap_or(0);
            transactions.push(PendingTransaction {
                lot_tran_no: row.get::<i32, _>("LotTranNo").unwrap_or(0),
                lot_no: row.get::<&str, _>("LotNo").unwrap_or("").to_string(),
                bin_no: row.get::<&str, _>("BinNo").unwrap_or("").to_string(),
                doc_no: row.get::<&str, _>("DocNo").unwrap_or("").to_string(),
                line_no: row.get::<i16, _>("IssueDocLineNo"),
                qty: row.get::<f64, _>("Qty").unwrap_or(0.0),
                transaction_type,
                type_name: transaction_type_name(transaction_type).to_string(),
                transaction_date: row
                    .get::<NaiveDateTime, _>("RecDate")
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
                status: row.get::<&str, _>("Processed").unwrap_or("").to_string(),
            });
        }

        Ok(transactions)
    }
}

/// Comma-separated outbound transaction types for the pending-commitment
/// filters, derived from the shared constant so the read side and the picker
/// can never disagree.
fn pending_types_sql() -> String {
    crate::constants::PENDING_OUTBOUND_TYPES
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Map a SQL Server error into the engine taxonomy: lock-wait exhaustion and
/// deadlock victims are retryable contention, socket timeouts are retryable
/// timeouts, everything else is a system error.
fn classify_db_error(err: tiberius::error::Error, context: &str) -> TransferError {
    use tiberius::error::Error;

    match &err {
        Error::Server(token) if token.code() == 1222 => {
            TransferError::Contention(format!("{context}: lock wait budget exhausted"))
        }
        Error::Server(token) if token.code() == 1205 => {
            TransferError::Contention(format!("{context}: chosen as deadlock victim"))
        }
        Error::Io { kind, .. } if *kind == std::io::ErrorKind::TimedOut => {
            TransferError::Timeout(format!("{context}: {err}"))
        }
        _ => TransferError::DatabaseError(format!("{context}: {err}")),
    }
}

/// GL inventory account for an INLOC inventory class.
fn inventory_account_for_class(class_key: &str) -> &'static str {
    match class_key.trim() {
        "RM" => "1110",
        "PK" | "PKG" => "1120",
        "FG" => "1130",
        "WIP" => "1140",
        _ => "1100",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_types_filter_matches_the_legacy_set() {
        assert_eq!(pending_types_sql(), "2,3,5,7,9,10,12,16,17,20,21");
    }

    #[test]
    fn inventory_class_maps_to_gl_account() {
        assert_eq!(inventory_account_for_class("RM"), "1110");
        assert_eq!(inventory_account_for_class(" PKG "), "1120");
        assert_eq!(inventory_account_for_class("FG"), "1130");
        assert_eq!(inventory_account_for_class(""), "1100");
        assert_eq!(inventory_account_for_class("ZZ"), "1100");
    }

    #[test]
    fn io_timeout_classifies_as_timeout() {
        let err = tiberius::error::Error::Io {
            kind: std::io::ErrorKind::TimedOut,
            message: "statement deadline exceeded".to_string(),
        };
        let classified = classify_db_error(err, "lock source lot");
        assert!(matches!(classified, TransferError::Timeout(_)));
        assert!(classified.is_retryable());
    }

    #[test]
    fn unknown_errors_classify_as_system() {
        let err = tiberius::error::Error::Io {
            kind: std::io::ErrorKind::ConnectionReset,
            message: "connection reset by peer".to_string(),
        };
        let classified = classify_db_error(err, "fetch availability");
        assert!(matches!(classified, TransferError::DatabaseError(_)));
        assert_eq!(classified.kind(), "SystemError");
    }
}
