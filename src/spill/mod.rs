pub mod cursor;
pub mod file;
pub mod queue;
pub mod record;

pub use queue::{AppendOutcome, SpillError, SpillQueue};
pub use record::{encode_frame, RecordError, SpillRecord};
