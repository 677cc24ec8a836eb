pub mod rest;
pub mod server;
pub mod webhook;

pub use rest::AppState;
pub use server::ApiServer;
