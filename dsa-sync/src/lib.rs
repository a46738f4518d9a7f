pub mod cli;
pub mod client;
pub mod load_config;
pub mod server;

pub use cli::{run, Cli, Commands};
pub use client::GirderClient;
