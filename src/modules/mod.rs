//! Built-in modules.

pub mod echo;
