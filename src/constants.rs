//! # Pipeline Constants
//!
//! Names and defaults shared by the queues, breakers and notification paths.

/// Queue lane names
pub mod lanes {
    pub const WEBHOOK: &str = "webhook";
    pub const MESSAGE: &str = "message";
}

/// Envelope type tags stored with durable jobs
pub mod job_kinds {
    pub const WEBHOOK: &str = "webhook";
    pub const SEND_MESSAGE: &str = "send_message";
}

/// Events forwarded to the live-status notifier
pub mod notifications {
    pub const MESSAGE_FAILED: &str = "message_failed";
    pub const DEAD_LETTER_RESOLVED: &str = "dead_letter_resolved";
}

/// Well-known circuit breaker component names
pub mod components {
    pub const MESSAGING_TRANSPORT: &str = "whatsapp";
    pub const DATABASE: &str = "database";
    pub const RECORD_STORE: &str = "supabase";
}

/// Prefix returned for inbound submissions rejected by the deduplication cache
pub const DUPLICATE_PREFIX: &str = "duplicate_";

/// Prefix for fallback queue item ids
pub const FALLBACK_ID_PREFIX: &str = "msg_";

/// Status codes treated as caller mistakes rather than dependency failures
pub const DEFAULT_EXCLUDED_STATUS_CODES: [u16; 5] = [400, 401, 403, 404, 422];
