pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod server;
pub mod state;

pub use config::SecurityConfig;
pub use dispatcher::dispatch;
pub use server::{DaemonError, Server};
pub use state::DaemonState;
