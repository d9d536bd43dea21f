//! # Storage Layer
//!
//! Permission store contract and its backends (in-memory, PostgreSQL), plus
//! the in-memory identity collaborator.

pub mod identity;
pub mod memory;
pub mod perms;
pub mod postgres;

pub use identity::InMemoryIdentityStore;
pub use memory::InMemoryPermsStore;
pub use perms::{PermsStore, PermsTransaction};
pub use postgres::PostgresPermsStore;
