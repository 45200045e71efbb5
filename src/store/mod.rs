//! Persistence layer — seen-key state behind a swappable backend.

pub mod file;
pub mod memory;
pub mod seen;
pub mod traits;

pub use file::{JsonFileStore, SeenDocument};
pub use memory::MemoryStore;
pub use seen::SeenStore;
pub use traits::StateStore;
