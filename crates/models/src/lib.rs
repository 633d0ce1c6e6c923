mod descriptor;
mod id;
mod message;

pub use descriptor::Descriptor;
pub use id::{MessageId, SessionId, Timestamp};
pub use message::{Message, MessageClass, ProtocolType, Recipient};
