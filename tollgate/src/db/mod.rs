//! Storage layer: the trait contract plus its two engines.

pub mod errors;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use errors::{DbError, Result};
pub use memory::MemoryStorage;
pub use postgres::PgStorage;
pub use store::{IdentityStore, SpendStore, Storage};
