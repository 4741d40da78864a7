pub mod cli;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod informer;
pub mod node;
pub mod provider;
pub mod server;
