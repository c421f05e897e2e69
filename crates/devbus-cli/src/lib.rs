//! devbus-cli: Command-line tools for devbus
//!
//! Provides the `devbus` binary: a loopback soak test that drives many
//! sessions across an impaired in-process link, and configuration helpers.

pub mod commands;
pub mod output;
