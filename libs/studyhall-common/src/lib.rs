pub mod id;
pub mod protocol;

pub use protocol::{DirectMessage, ServerEvent};
