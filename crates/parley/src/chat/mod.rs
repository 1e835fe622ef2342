//! Chat entities and their persistence.
//!
//! The repository is the only writer of the chat tables and the point where
//! committed mutations are handed to the change notifier.

mod directory;
mod models;
mod repository;
mod responder;
mod sink;

pub use directory::ChatDirectory;
pub use models::{
    Account, Conversation, CreateConversationRequest, Message, MessageRole, PostMessageRequest,
    PostMessageResponse, PutSettingRequest, Setting, UpdateConversationRequest, User,
};
pub use repository::ChatRepository;
pub use responder::{EchoResponder, Responder};
pub use sink::MessageStreamSink;
