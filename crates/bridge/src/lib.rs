pub mod cli;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod registry;
pub mod runtime;
pub mod texture;
