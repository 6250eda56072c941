//! OneBot v11 over a reverse WebSocket.

pub mod api;
pub mod event;
pub mod message;
pub mod registry;
pub mod server;

pub use api::{ApiError, Bot, ForwardNode};
pub use event::{Event, MessageEvent, MessageType, SessionKey};
pub use message::{Message, Segment};
pub use registry::BotRegistry;
