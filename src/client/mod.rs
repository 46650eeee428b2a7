//! Client Module
//!
//! Writers broadcast mutations and return immediately. Readers broadcast a
//! query and wait for the first reply correlated to their request id.

mod correlation;
mod reader;
mod writer;

pub use correlation::{CorrelationArena, ReplySlot};
pub use reader::{ReadMode, Reader};
pub use writer::Writer;
