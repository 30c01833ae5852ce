//! IO modules - external system interfaces
//!
//! This module contains every collaborator the core talks to:
//! - `store` - remote document store trait (change feeds, CAS writes, batches)
//! - `memory_store` - in-process store with JSON snapshot persistence
//! - `identity` - identity provisioning trait and in-memory provider
//! - `tabular` - CSV reading and writing for imports and exports
//! - `audit` - audit sinks (tracing, JSONL file, in-memory)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod audit;
pub mod identity;
pub mod memory_store;
pub mod prometheus;
pub mod store;
pub mod tabular;

// Re-export commonly used types
pub use audit::{AuditEvent, AuditSink, JsonlAuditLog, MemoryAuditSink, TracingAuditSink};
pub use identity::{IdentityProvider, MemoryIdentityProvider};
pub use memory_store::{MemoryStore, StoreSnapshot};
pub use store::{BatchWrite, ChangeFeed, FeedEvent, RemoteStore, Versioned};
