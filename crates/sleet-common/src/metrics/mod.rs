//! Metrics and observability infrastructure.
//!
//! This module groups all observability-related components:
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

// Re-export commonly used items
pub use server::{init_global, init_test};

/// Macro for emitting metric events (Vector-style pattern).
///
/// This macro calls the `InternalEvent::emit()` method on the given event,
/// which records the corresponding Prometheus metric.
///
/// # Example
///
/// ```ignore
/// use sleet_common::metrics::events::{RecordsParsed, BytesRead};
///
/// emit!(RecordsParsed { count: 100, dataset: "facts".into() });
/// emit!(BytesRead { bytes: 1024, dataset: "facts".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

// Re-export the macro at crate root
pub use emit;
