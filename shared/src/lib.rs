pub mod entry;
pub mod types;

pub use entry::{decode_entry, encode_entry, ApplyOutcome, EntryCodecError, LogEntry};
pub use types::{Node, NodeStatus, Task, TaskStatus};
