//! Stack configuration
//!
//! This module handles parsing of tether `.conf` files with `[Stack]` and
//! `[Bootstrap]` sections.

mod parser;

pub use parser::StackConfig;
