// Tidemark Kernel
//
// Reliable consumption of an ordered event log: paginated reads,
// conditional appends under optimistic concurrency, and catch-up
// subscriptions that hand off to a live feed without losing or
// doubling the boundary entry.

pub mod append;
pub mod catchup;
pub mod fold;
pub mod log;
pub mod reader;
pub mod retry;
