//! Ambient pieces shared by the bot binaries: environment config, local
//! store paths, logging and the SQLite database.

pub mod config;
pub mod localstore;
pub mod logging;
pub mod storage;

pub use config::BotConfig;
pub use localstore::LocalStore;
pub use storage::Database;
