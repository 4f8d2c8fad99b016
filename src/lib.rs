pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod record;
pub mod relay;
pub mod scope;
pub mod session;
pub mod store;
pub mod transport;
