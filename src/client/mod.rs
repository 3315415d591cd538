//! Client-side session protocol: the conversation view and the connection
//! that feeds it.

pub mod conversation;
pub mod session;

pub use conversation::{Conversation, ConversationMessage, PermissionRequest, ResolvedPermission, Role};
pub use session::{ClientConnection, ClientSession};
