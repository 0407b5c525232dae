pub mod conversation;
pub mod events;
pub mod message;
