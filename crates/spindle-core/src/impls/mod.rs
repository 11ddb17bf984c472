//! Reference implementations of the ports.
//!
//! - **InMemoryTaskStore**: process-local task store (tests, demos, and
//!   embedders that do not need durable history).

pub mod inmem_store;

pub use self::inmem_store::InMemoryTaskStore;
