//! Configuration schema and file-backed store

mod schema;
mod store;

pub use schema::{
    AppConfig, ConnectionConfig, ErrorNotification, LogConfig, LogFormat, StreamDescriptor,
};
pub use store::{ConfigChange, ConfigStore};
