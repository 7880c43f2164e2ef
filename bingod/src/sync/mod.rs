pub mod backoff;
pub mod connectivity;
pub mod executor;
pub mod manager;
pub mod queue;
pub mod store;
