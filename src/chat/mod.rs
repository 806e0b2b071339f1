pub mod hub;
pub mod message_store;

pub use hub::{ChatEnvelope, ChatHub};
pub use message_store::{Message, MessageType, PageState};
