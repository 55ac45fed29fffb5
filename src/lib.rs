//! Chat session client for the OKR workspace: the state owner behind the
//! chat screens, their view state, and an in-memory backend with a
//! WebSocket front end for development.

pub mod attachments;
pub mod backend;
pub mod error;
pub mod memory;
pub mod messages;
pub mod model;
pub mod mutation;
pub mod provider;
pub mod server;
pub mod settings;
pub mod typing;
pub mod views;

pub use backend::ChatBackend;
pub use error::{BackendError, ChatError, ChatResult};
pub use memory::InMemoryBackend;
pub use provider::{ChatProvider, ChatSnapshot, LoadState};
pub use settings::Settings;
