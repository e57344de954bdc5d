//! Service layer: the single façade the transport talks to.
//!
//! [`KvService`] owns the sharded store, the TTL index, the append log and
//! the snapshot store, and enforces the ordering rules between them:
//! validate before mutating, log before acknowledging, check the memory
//! cap before admitting, prefer the append log over snapshots at startup.

pub mod coordinator;

pub use coordinator::KvService;
