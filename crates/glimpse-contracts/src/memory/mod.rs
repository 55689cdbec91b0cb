mod identity;
mod persist;
mod records;

pub use identity::{element_id, screen_fingerprint_digest};
pub use persist::{load_store, write_store, StoreLoad};
pub use records::{Element, LocationRecord, MemoryStore, STORE_SCHEMA_VERSION};
