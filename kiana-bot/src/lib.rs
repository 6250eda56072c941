//! A OneBot v11 chat bot: nicknames, gold and fund prices, share-link
//! resolution and image search.

pub mod background;
pub mod dispatch;
pub mod media;
pub mod onebot;
pub mod plugins;
pub mod routes;
pub mod settings;
pub mod state;
