pub const MESSAGES_RECEIVED: &str = "archiver_messages_received";
pub const MESSAGES_ACCEPTED: &str = "archiver_messages_accepted";
pub const MESSAGES_DEDUPLICATED: &str = "archiver_messages_deduplicated";
pub const EMPTY_PAYLOADS: &str = "archiver_empty_payloads";
pub const ACK_FAILURES: &str = "archiver_ack_failures";

pub const BATCHES_STAGED: &str = "archiver_batches_staged";
pub const STAGED_BYTES: &str = "archiver_staged_bytes";
pub const FLUSH_RETRIES: &str = "archiver_flush_retries";

pub const ARCHIVES_WRITTEN: &str = "archiver_archives_written";
pub const ARCHIVE_RECORDS: &str = "archiver_archive_records";
pub const ARCHIVE_BYTES: &str = "archiver_archive_bytes";
pub const UPLOAD_DURATION_SECONDS: &str = "archiver_upload_duration_seconds";
pub const UPLOAD_ATTEMPT_FAILURES: &str = "archiver_upload_attempt_failures";
pub const MULTIPART_UPLOADS: &str = "archiver_multipart_uploads";
