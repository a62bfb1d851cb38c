pub mod rsm;
pub mod state;

pub use rsm::{ManifestSnapshot, Rsm, SnapshotError};
pub use state::{ManifestError, TaskManifest};
