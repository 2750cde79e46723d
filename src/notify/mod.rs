//! Notification bus
//!
//! Databases and replicators publish events through `ListenerRegistry`.
//! Subscribers hold a `ListenerToken` and remove themselves explicitly.

mod events;
mod registry;

pub use events::{ChangeSource, DatabaseChange, DocumentChange};
pub use registry::{ListenerRegistry, ListenerToken};
