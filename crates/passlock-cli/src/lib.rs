//! Passlock CLI - Command-line front end for the passcode guard
//!
//! Exposes the guard's operations as subcommands against the configured
//! settings file and NTP servers.

pub mod commands;

pub use commands::{run, Cli, Commands};
