use proptest::prelude::*;
use relay_core::messaging::Priority;
use std::time::Duration;

/// Strategy for generating priority classes
pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::High), Just(Priority::Normal), Just(Priority::Low)]
}

/// Strategy for generating (base, max) backoff bounds in milliseconds
pub fn backoff_bounds_strategy() -> impl Strategy<Value = (Duration, Duration)> {
    (1u64..5_000, 1u64..120_000).prop_map(|(base, max)| {
        (Duration::from_millis(base), Duration::from_millis(base.max(max)))
    })
}

/// Strategy for generating natural message ids, duplicates likely
pub fn message_ids_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("wamid\\.[a-c][0-9]", 1..40)
}

/// Strategy for generating failure sequences (true = transient failure)
pub fn failure_script_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(any::<bool>(), 0..20)
}
