//! dockhandctl library, exposed for integration testing.

pub mod cli;
pub mod commands;
pub mod connection;
pub mod output;
