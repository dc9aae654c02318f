mod core;
mod entry;
mod error;
mod group;

pub use core::{CompleteOutcome, ResolvedCandidate, SelectedUpload, UploadQueue};
pub use entry::{SlotAwait, SlotOutcome};
pub use error::QueueError;
pub use group::Group;
