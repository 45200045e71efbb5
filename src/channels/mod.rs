//! Collaborators at the edges of the relay: where items come from and
//! where delivery units go.

pub mod snapshot;
pub mod telegram;

pub use snapshot::SnapshotEnumerator;
pub use telegram::TelegramSink;
