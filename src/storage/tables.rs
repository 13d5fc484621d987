use redb::TableDefinition;

/// Blob records: fingerprint hex -> BlobRecord (msgpack)
pub const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// User file links: "owner\0fingerprint\0file_name" -> UserFileLink (msgpack)
pub const USER_FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("user_files");

/// Transfer queue: queue id -> QueuedTransfer (msgpack), ordered by id
pub const TRANSFER_QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("transfer_queue");

/// Claim order: (due time in unix millis, queue id). An entry is due at its
/// lease expiry while leased and at `available_at` otherwise.
pub const TRANSFER_SCHEDULE: TableDefinition<(i64, u64), ()> =
    TableDefinition::new("transfer_schedule");

/// At most one queued transfer per fingerprint: fingerprint hex -> queue id
pub const QUEUED_FINGERPRINTS: TableDefinition<&str, u64> =
    TableDefinition::new("queued_fingerprints");

/// Transfers that exhausted their retries: fingerprint hex -> StuckTransfer (msgpack)
pub const STUCK_TRANSFERS: TableDefinition<&str, &[u8]> = TableDefinition::new("stuck_transfers");

/// Queue counters (next id)
pub const QUEUE_META: TableDefinition<&str, u64> = TableDefinition::new("queue_meta");
