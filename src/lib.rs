pub mod client;
pub mod config;
pub mod demo;
pub mod environment;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod rpc;
