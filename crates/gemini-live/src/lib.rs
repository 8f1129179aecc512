mod client;
pub mod config;
pub mod types;

pub use client::{ClientTx, GeminiClient, ServerEvent, connect};
pub use config::Config;
