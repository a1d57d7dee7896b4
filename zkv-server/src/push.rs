//! The push pipeline.
//!
//! Assembles one ordered batch covering everything a client still needs
//! for a database: the bundle preface, a paginated range scan with gap
//! detection and repair, the contiguity gate, and the compaction hint.
//!
//! Scans run without the database's critical section on a snapshot of its
//! position; the emit step re-acquires the lock, re-checks the protocol
//! preconditions, and trims against concurrent delivery before writing to
//! the socket.

use crate::connection::{Connection, DatabaseState};
use crate::error::StoreError;
use crate::server::ServerMetrics;
use crate::socket::ClientSocket;
use crate::store::{now_millis, BundleStore, TransactionLogStore};
use std::sync::atomic::Ordering;
use zkv_types::{
    estimated_size, ApplyTransactions, BundleBlob, Command, DatabaseId, SeqNo, ServerMessage,
    TransactionRecord,
};

/// Tolerated dwell time for an unfilled sequence number before the server
/// declares the commit dead and rolls the slot back.
pub const ROLLBACK_GAP_AGE_MS: i64 = 10_000;

/// Unbundled-bytes threshold at which an outbound batch carries the
/// compaction hint.
pub const TRANSACTION_SIZE_BUNDLE_TRIGGER: u64 = 50 * 1024;

/// Page size for transaction-log range scans.
pub(crate) const SCAN_PAGE_SIZE: u32 = 100;

/// How a push was requested.
///
/// Opening means both header fields are present and no resume position;
/// reopening means a resume position is present. Anything else is an
/// incremental push against an already-initialized database.
#[derive(Debug, Clone, Default)]
pub struct PushArgs {
    /// Database name hash, for a first-time open.
    pub db_name_hash: Option<String>,
    /// Encrypted database key, for a first-time open.
    pub db_key: Option<String>,
    /// Resume position, for a reopen.
    pub reopen_at_seq_no: Option<SeqNo>,
}

impl PushArgs {
    fn is_opening(&self) -> bool {
        self.db_name_hash.is_some() && self.db_key.is_some() && self.reopen_at_seq_no.is_none()
    }

    fn is_reopening(&self) -> bool {
        self.reopen_at_seq_no.is_some()
    }
}

/// Range-scan states. A gap too young to roll back aborts the scan; a
/// stale gap is repaired with sentinels and scanning resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    GapYoung,
    GapRolledBack,
    Done,
}

/// What a range scan produced.
#[derive(Debug)]
struct ScanResult {
    /// Records (repaired sentinels included) past the snapshot position,
    /// in ascending order.
    buffer: Vec<TransactionRecord>,
    /// The first missing slot of a gap too young to roll back, when the
    /// scan stopped early.
    gap_pending: Option<SeqNo>,
}

/// Assemble and emit one batch for `database_id` on `conn`.
///
/// Errors out of the store abort the push; the caller logs and swallows
/// them, and a later client action or commit fan-out retries.
pub async fn push(
    log: &dyn TransactionLogStore,
    bundles: &dyn BundleStore,
    metrics: &ServerMetrics,
    conn: &Connection,
    database_id: DatabaseId,
    args: PushArgs,
) -> crate::error::Result<()> {
    let Some(state) = conn.database(&database_id) else {
        tracing::debug!(
            "push for database {database_id} not opened on {:?}",
            conn.id()
        );
        return Ok(());
    };
    metrics.pushes_total.fetch_add(1, Ordering::Relaxed);

    let (bundle_seq_no, snapshot_last) = {
        let guard = state.lock().await;
        (guard.bundle_seq_no, guard.last_seq_no)
    };

    let mut payload = ApplyTransactions::bare(database_id);
    payload.db_name_hash = args.db_name_hash.clone();
    payload.db_key = args.db_key.clone();

    // Bundle preface: the client holds a bundle it has never advanced
    // past, so the batch starts from the snapshot instead of seq 1.
    let mut cursor = snapshot_last;
    if bundle_seq_no > SeqNo::zero() && snapshot_last == SeqNo::zero() {
        match bundles.bundle(&database_id, bundle_seq_no).await? {
            Some(blob) => {
                payload.bundle_seq_no = Some(bundle_seq_no.value());
                payload.bundle = Some(BundleBlob::from_bytes(blob));
                cursor = bundle_seq_no;
            }
            None => {
                tracing::warn!(
                    "bundle {bundle_seq_no} missing for database {database_id}; abandoning push"
                );
                return Ok(());
            }
        }
    }

    let scan = scan_log(log, metrics, &database_id, cursor, snapshot_last).await?;
    if let Some(missing) = scan.gap_pending {
        tracing::debug!("database {database_id}: gap at {missing} too young to roll back");
    }

    let mut guard = state.lock().await;

    // Another push may have mutated the state while the scan was
    // outstanding; converging is the retry's job, not this batch's.
    if args.is_opening() && guard.last_seq_no != SeqNo::zero() {
        tracing::warn!("database {database_id}: open raced a finished opener, dropping batch");
        return Ok(());
    }
    if let Some(reopen_at) = args.reopen_at_seq_no {
        if guard.last_seq_no != reopen_at {
            tracing::warn!(
                "database {database_id}: reopen position moved from {reopen_at}, dropping batch"
            );
            return Ok(());
        }
    }
    if !args.is_opening() && !args.is_reopening() && !guard.init {
        tracing::warn!("database {database_id}: push before open completed, dropping batch");
        return Ok(());
    }

    if scan.buffer.is_empty() {
        // An open still owes the client its header (and bundle, if any).
        if args.is_opening() || args.is_reopening() {
            let had_bundle = payload.bundle.is_some();
            send_swallowing(conn.socket(), &ServerMessage::ApplyTransactions(payload)).await;
            if had_bundle {
                guard.last_seq_no = bundle_seq_no;
            }
            guard.init = true;
        }
        return Ok(());
    }

    send_payload(conn.socket(), metrics, payload, scan.buffer, &mut guard).await;
    Ok(())
}

/// Walk the log from `cursor`, page by page, repairing stale gaps.
async fn scan_log(
    log: &dyn TransactionLogStore,
    metrics: &ServerMetrics,
    database_id: &DatabaseId,
    mut cursor: SeqNo,
    snapshot_last: SeqNo,
) -> crate::error::Result<ScanResult> {
    let mut buffer = Vec::new();
    let mut gap_pending = None;
    let mut state = ScanState::Scanning;

    while state != ScanState::Done {
        let page = log
            .transactions_after(database_id, cursor, SCAN_PAGE_SIZE)
            .await?;
        let exhausted = (page.len() as u32) < SCAN_PAGE_SIZE;

        for record in page {
            if record.seq_no > cursor.next() {
                let age = now_millis() - record.creation_date;
                state = if age > ROLLBACK_GAP_AGE_MS {
                    let sentinels = write_rollbacks(
                        log,
                        *database_id,
                        cursor.next(),
                        SeqNo::new(record.seq_no.value() - 1),
                    )
                    .await?;
                    metrics
                        .rollbacks_written
                        .fetch_add(sentinels.len() as u64, Ordering::Relaxed);
                    for sentinel in sentinels {
                        if sentinel.seq_no > snapshot_last {
                            buffer.push(sentinel);
                        }
                    }
                    ScanState::GapRolledBack
                } else {
                    gap_pending = Some(cursor.next());
                    ScanState::GapYoung
                };
            }
            if state == ScanState::GapYoung {
                break;
            }

            cursor = record.seq_no;
            if record.seq_no > snapshot_last {
                buffer.push(record);
            }
            if state == ScanState::GapRolledBack {
                state = ScanState::Scanning;
            }
        }

        match state {
            ScanState::GapYoung => break,
            _ if exhausted => state = ScanState::Done,
            _ => {}
        }
    }

    Ok(ScanResult { buffer, gap_pending })
}

/// Insert rollback sentinels for every slot in `[from, to]`.
///
/// A slot that filled in the meantime loses the conditional put; the
/// error propagates and the surrounding push aborts, leaving the retry
/// scan to observe whichever record won. Sentinels written before the
/// failure are durable log entries either way.
pub(crate) async fn write_rollbacks(
    log: &dyn TransactionLogStore,
    database_id: DatabaseId,
    from: SeqNo,
    to: SeqNo,
) -> Result<Vec<TransactionRecord>, StoreError> {
    let mut sentinels = Vec::new();
    for seq in from.value()..=to.value() {
        let record = TransactionRecord {
            database_id,
            seq_no: SeqNo::new(seq),
            command: Command::Rollback,
            creation_date: now_millis(),
        };
        log.put_if_absent(&record).await?;
        sentinels.push(record);
    }
    Ok(sentinels)
}

/// Emit one batch. Called with the database's critical section held.
///
/// Trims entries another delivery already covered, refuses anything
/// non-contiguous, stamps the compaction hint, and advances the
/// delivery position.
pub(crate) async fn send_payload(
    socket: &dyn ClientSocket,
    metrics: &ServerMetrics,
    mut payload: ApplyTransactions,
    mut buffer: Vec<TransactionRecord>,
    database: &mut DatabaseState,
) {
    buffer.retain(|record| record.seq_no > database.last_seq_no);
    let Some(first_seq) = buffer.first().map(|r| r.seq_no) else {
        return;
    };

    let after_bundle = payload
        .bundle_seq_no
        .map(|bundle| first_seq.value() == bundle + 1)
        .unwrap_or(false);
    if first_seq != database.last_seq_no.next() && !after_bundle {
        tracing::warn!(
            "database {}: dropping non-contiguous batch starting at {first_seq} after {}",
            payload.db_id,
            database.last_seq_no
        );
        return;
    }

    let mut size = 0u64;
    for record in &buffer {
        size += estimated_size(record);
        payload.transaction_log.push(record.to_wire());
    }
    let last_seq = buffer.last().map(|r| r.seq_no).unwrap_or(first_seq);

    if database.transaction_log_size + size >= TRANSACTION_SIZE_BUNDLE_TRIGGER {
        payload.build_bundle = Some(true);
        database.transaction_log_size = 0;
        metrics.bundle_hints.fetch_add(1, Ordering::Relaxed);
    } else {
        database.transaction_log_size += size;
    }

    metrics
        .transactions_delivered
        .fetch_add(payload.transaction_log.len() as u64, Ordering::Relaxed);
    send_swallowing(socket, &ServerMessage::ApplyTransactions(payload)).await;

    database.last_seq_no = last_seq;
    database.init = true;
}

/// A failed send means the socket is dying; the client reconnects and
/// re-opens, so nothing compensates here.
async fn send_swallowing(socket: &dyn ClientSocket, message: &ServerMessage) {
    if let Err(e) = socket.send(message).await {
        tracing::debug!("send failed, dropping message: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockSocket;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use zkv_types::{ClientId, UserId};

    struct Rig {
        store: Arc<MemoryStore>,
        conn: Connection,
        socket: MockSocket,
        metrics: ServerMetrics,
    }

    fn rig() -> Rig {
        let socket = MockSocket::new();
        let conn = Connection::new(UserId::new(), ClientId::new(), Arc::new(socket.clone()));
        Rig {
            store: Arc::new(MemoryStore::new()),
            conn,
            socket,
            metrics: ServerMetrics::default(),
        }
    }

    impl Rig {
        async fn seed(&self, database_id: DatabaseId, seq_no: i64, age_ms: i64) {
            self.store
                .put_if_absent(&TransactionRecord {
                    database_id,
                    seq_no: SeqNo::new(seq_no),
                    command: Command::Insert {
                        key: format!("key-{seq_no}"),
                        record: json!({"ciphertext": "payload"}),
                    },
                    creation_date: now_millis() - age_ms,
                })
                .await
                .unwrap();
        }

        async fn push(&self, database_id: DatabaseId, args: PushArgs) {
            push(
                self.store.as_ref(),
                self.store.as_ref(),
                &self.metrics,
                &self.conn,
                database_id,
                args,
            )
            .await
            .unwrap();
        }

        fn batches(&self) -> Vec<ApplyTransactions> {
            self.socket
                .sent_messages()
                .into_iter()
                .map(|m| match m {
                    ServerMessage::ApplyTransactions(batch) => batch,
                    other => panic!("unexpected message: {other:?}"),
                })
                .collect()
        }
    }

    fn open_args() -> PushArgs {
        PushArgs {
            db_name_hash: Some("h".into()),
            db_key: Some("k".into()),
            reopen_at_seq_no: None,
        }
    }

    fn seqs(batch: &ApplyTransactions) -> Vec<i64> {
        batch.transaction_log.iter().map(|t| t.seq_no).collect()
    }

    #[tokio::test]
    async fn first_open_of_empty_log_sends_header_only() {
        let r = rig();
        let db = DatabaseId::new();
        let state = r.conn.open_database(db, -1, None);

        r.push(db, open_args()).await;

        let batches = r.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].db_name_hash.as_deref(), Some("h"));
        assert_eq!(batches[0].db_key.as_deref(), Some("k"));
        assert!(batches[0].bundle.is_none());
        assert!(batches[0].transaction_log.is_empty());

        let guard = state.lock().await;
        assert!(guard.init);
        assert_eq!(guard.last_seq_no, SeqNo::zero());
    }

    #[tokio::test]
    async fn open_with_bundle_prefaces_snapshot() {
        let r = rig();
        let db = DatabaseId::new();
        r.store.put_bundle(&db, SeqNo::new(100), b"snapshot".to_vec());
        r.seed(db, 101, 0).await;
        r.seed(db, 102, 0).await;

        let state = r.conn.open_database(db, 100, None);
        r.push(db, open_args()).await;

        let batches = r.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].bundle_seq_no, Some(100));
        assert_eq!(
            batches[0].bundle.as_ref().map(|b| b.as_bytes().to_vec()),
            Some(b"snapshot".to_vec())
        );
        assert_eq!(seqs(&batches[0]), vec![101, 102]);
        assert!(batches[0].build_bundle.is_none());

        assert_eq!(state.lock().await.last_seq_no, SeqNo::new(102));
    }

    #[tokio::test]
    async fn open_with_bundle_and_empty_tail_lands_on_bundle() {
        let r = rig();
        let db = DatabaseId::new();
        r.store.put_bundle(&db, SeqNo::new(40), b"snapshot".to_vec());

        let state = r.conn.open_database(db, 40, None);
        r.push(db, open_args()).await;

        let batches = r.batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].transaction_log.is_empty());
        assert_eq!(batches[0].bundle_seq_no, Some(40));

        let guard = state.lock().await;
        assert!(guard.init);
        assert_eq!(guard.last_seq_no, SeqNo::new(40));
    }

    #[tokio::test]
    async fn missing_bundle_abandons_push() {
        let r = rig();
        let db = DatabaseId::new();
        let state = r.conn.open_database(db, 100, None);

        r.push(db, open_args()).await;

        assert!(r.socket.sent_messages().is_empty());
        assert!(!state.lock().await.init);
    }

    #[tokio::test]
    async fn young_gap_stops_the_scan() {
        let r = rig();
        let db = DatabaseId::new();
        r.seed(db, 5, 60_000).await;
        r.seed(db, 7, 2_000).await; // created 2s ago: gap at 6 is young

        let state = r.conn.open_database(db, 0, Some(SeqNo::new(4)));
        r.push(db, PushArgs::default()).await;

        let batches = r.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(seqs(&batches[0]), vec![5]);
        assert_eq!(state.lock().await.last_seq_no, SeqNo::new(5));
        assert_eq!(r.store.log_len(&db), 2); // no sentinel written
    }

    #[tokio::test]
    async fn stale_gap_is_rolled_back_and_delivered() {
        let r = rig();
        let db = DatabaseId::new();
        r.seed(db, 5, 60_000).await;
        r.seed(db, 7, 11_000).await; // gap at 6 is past the threshold

        let state = r.conn.open_database(db, 0, Some(SeqNo::new(5)));
        r.push(db, PushArgs::default()).await;

        let batches = r.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(seqs(&batches[0]), vec![6, 7]);
        assert_eq!(batches[0].transaction_log[0].command, "Rollback");
        assert_eq!(state.lock().await.last_seq_no, SeqNo::new(7));
        assert_eq!(r.store.log_len(&db), 3); // sentinel is durable
    }

    #[tokio::test]
    async fn multiple_stale_gaps_repair_in_one_scan() {
        let r = rig();
        let db = DatabaseId::new();
        for seq in [2, 5, 9] {
            r.seed(db, seq, 30_000).await;
        }

        let state = r.conn.open_database(db, 0, Some(SeqNo::new(0)));
        r.push(db, PushArgs::default()).await;

        let batches = r.batches();
        assert_eq!(seqs(&batches[0]), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(state.lock().await.last_seq_no, SeqNo::new(9));
        assert_eq!(r.metrics.rollbacks_written.load(Ordering::Relaxed), 6);
    }

    #[tokio::test]
    async fn rollback_writer_aborts_on_occupied_slot() {
        let r = rig();
        let db = DatabaseId::new();
        r.seed(db, 3, 0).await;

        // Slot 3 is occupied, so the window [2, 4] fails partway through.
        let err = write_rollbacks(r.store.as_ref(), db, SeqNo::new(2), SeqNo::new(4))
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());

        // The sentinel at 2 was durably written before the failure.
        let page = r
            .store
            .transactions_after(&db, SeqNo::new(1), 10)
            .await
            .unwrap();
        assert_eq!(page[0].seq_no, SeqNo::new(2));
        assert_eq!(page[0].command.name(), "Rollback");
        assert_eq!(r.store.log_len(&db), 2);
    }

    #[tokio::test]
    async fn rollback_writer_is_idempotent_modulo_filled_slots() {
        let r = rig();
        let db = DatabaseId::new();

        let first = write_rollbacks(r.store.as_ref(), db, SeqNo::new(2), SeqNo::new(4))
            .await
            .unwrap();
        assert_eq!(first.len(), 3);

        // The same window again: every slot is now filled, so the first
        // conditional put loses.
        let err = write_rollbacks(r.store.as_ref(), db, SeqNo::new(2), SeqNo::new(4))
            .await
            .unwrap_err();
        assert!(err.is_condition_failed());
        assert_eq!(r.store.log_len(&db), 3);
    }

    #[tokio::test]
    async fn bundle_trigger_sets_hint_and_resets_counter() {
        let r = rig();
        let db = DatabaseId::new();
        let state = r.conn.open_database(db, 0, Some(SeqNo::new(0)));

        // Two ~30KiB records cross the 50KiB threshold.
        for seq in [1, 2] {
            r.store
                .put_if_absent(&TransactionRecord {
                    database_id: db,
                    seq_no: SeqNo::new(seq),
                    command: Command::Insert {
                        key: format!("key-{seq}"),
                        record: json!({"ciphertext": "x".repeat(30 * 1024)}),
                    },
                    creation_date: now_millis(),
                })
                .await
                .unwrap();
        }
        r.push(db, PushArgs::default()).await;

        let batches = r.batches();
        assert_eq!(batches[0].build_bundle, Some(true));
        assert_eq!(state.lock().await.transaction_log_size, 0);

        // A small follow-up accumulates without the hint.
        r.seed(db, 3, 0).await;
        r.push(db, PushArgs::default()).await;

        let batches = r.batches();
        assert!(batches[1].build_bundle.is_none());
        assert!(state.lock().await.transaction_log_size > 0);
    }

    #[tokio::test]
    async fn open_race_with_finished_opener_drops_batch() {
        let r = rig();
        let db = DatabaseId::new();
        let state = r.conn.open_database(db, -1, None);

        // Another opener finished while our scan was outstanding.
        {
            let mut guard = state.lock().await;
            guard.last_seq_no = SeqNo::new(5);
            guard.init = true;
        }

        r.push(db, open_args()).await;
        assert!(r.socket.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn reopen_race_drops_batch() {
        let r = rig();
        let db = DatabaseId::new();
        let state = r.conn.open_database(db, 0, Some(SeqNo::new(10)));

        {
            let mut guard = state.lock().await;
            guard.last_seq_no = SeqNo::new(12);
        }

        r.push(
            db,
            PushArgs {
                reopen_at_seq_no: Some(SeqNo::new(10)),
                ..PushArgs::default()
            },
        )
        .await;
        assert!(r.socket.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn incremental_push_before_open_is_dropped() {
        let r = rig();
        let db = DatabaseId::new();
        r.seed(db, 1, 0).await;
        let state = r.conn.open_database(db, -1, None);

        r.push(db, PushArgs::default()).await;

        assert!(r.socket.sent_messages().is_empty());
        assert!(!state.lock().await.init);
    }

    #[tokio::test]
    async fn push_for_unopened_database_is_a_noop() {
        let r = rig();
        r.push(DatabaseId::new(), PushArgs::default()).await;
        assert!(r.socket.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn scan_paginates_across_pages() {
        let r = rig();
        let db = DatabaseId::new();
        for seq in 1..=(SCAN_PAGE_SIZE as i64 + 50) {
            r.seed(db, seq, 60_000).await;
        }

        let state = r.conn.open_database(db, 0, Some(SeqNo::new(0)));
        r.push(db, PushArgs::default()).await;

        let batches = r.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].transaction_log.len(),
            SCAN_PAGE_SIZE as usize + 50
        );
        assert_eq!(
            state.lock().await.last_seq_no,
            SeqNo::new(SCAN_PAGE_SIZE as i64 + 50)
        );
    }

    #[tokio::test]
    async fn delivered_seqs_stay_monotonic_across_pushes() {
        let r = rig();
        let db = DatabaseId::new();
        let _state = r.conn.open_database(db, 0, Some(SeqNo::new(0)));

        r.seed(db, 1, 0).await;
        r.seed(db, 2, 0).await;
        r.push(db, PushArgs::default()).await;

        r.seed(db, 3, 0).await;
        r.push(db, PushArgs::default()).await;
        // Re-pushing with nothing new emits nothing.
        r.push(db, PushArgs::default()).await;

        let all: Vec<i64> = r.batches().iter().flat_map(|b| seqs(b)).collect();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn send_payload_trims_entries_already_delivered() {
        let r = rig();
        let db = DatabaseId::new();
        let mut database = DatabaseState {
            bundle_seq_no: SeqNo::NONE,
            last_seq_no: SeqNo::new(5),
            transaction_log_size: 0,
            init: true,
        };

        let buffer: Vec<TransactionRecord> = (4..=6)
            .map(|seq| TransactionRecord {
                database_id: db,
                seq_no: SeqNo::new(seq),
                command: Command::Rollback,
                creation_date: now_millis(),
            })
            .collect();

        send_payload(
            &r.socket,
            &r.metrics,
            ApplyTransactions::bare(db),
            buffer,
            &mut database,
        )
        .await;

        let batches = r.batches();
        assert_eq!(seqs(&batches[0]), vec![6]);
        assert_eq!(database.last_seq_no, SeqNo::new(6));
    }

    #[tokio::test]
    async fn send_payload_refuses_non_contiguous_batch() {
        let r = rig();
        let db = DatabaseId::new();
        let mut database = DatabaseState {
            bundle_seq_no: SeqNo::NONE,
            last_seq_no: SeqNo::new(5),
            transaction_log_size: 0,
            init: true,
        };

        let buffer = vec![TransactionRecord {
            database_id: db,
            seq_no: SeqNo::new(8),
            command: Command::Rollback,
            creation_date: now_millis(),
        }];

        send_payload(
            &r.socket,
            &r.metrics,
            ApplyTransactions::bare(db),
            buffer,
            &mut database,
        )
        .await;

        assert!(r.socket.sent_messages().is_empty());
        assert_eq!(database.last_seq_no, SeqNo::new(5));
    }
}
