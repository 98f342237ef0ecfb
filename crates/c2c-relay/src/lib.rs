pub mod config;
pub mod error;
pub mod middleware;
pub mod server;
pub mod session;
pub mod store;
pub mod sync;
