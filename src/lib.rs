pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod hub;
pub mod lifecycle;
pub mod server;
pub mod store;
