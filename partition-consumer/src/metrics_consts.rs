// ==== Reader metrics ====
/// Counter for records dropped by a reader because their offset did not advance
pub const READER_OFFSETS_SKIPPED: &str = "partition_consumer_reader_offsets_skipped_total";

/// Counter for read errors surfaced by readers, labelled by error type
pub const READER_READ_ERRORS: &str = "partition_consumer_read_errors_total";

// ==== Session metrics ====
/// Gauge for the number of forwarding tasks currently running
pub const SESSION_ACTIVE_READERS: &str = "partition_consumer_active_readers";

/// Counter for messages the delivery stream handed to the caller
pub const SESSION_MESSAGES_DELIVERED: &str = "partition_consumer_messages_delivered_total";

/// Histogram for time spent waiting on a full partition lane (ms)
pub const SESSION_LANE_SEND_WAIT_MS: &str = "partition_consumer_lane_send_wait_ms";

/// Counter for failed subscribe calls, labelled by error type
pub const SESSION_SUBSCRIBE_ERRORS: &str = "partition_consumer_subscribe_errors_total";

/// Counter for forwarding tasks aborted after the shutdown grace period
pub const SESSION_ABANDONED_TASKS: &str = "partition_consumer_abandoned_tasks_total";

// ==== Offset bookkeeping ====
/// Counter for delivered offsets that failed to advance
pub const DELIVERED_OFFSET_REGRESSION: &str =
    "partition_consumer_delivered_offset_regression_total";
