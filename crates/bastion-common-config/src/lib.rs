//! Configuration loading for Bastion.
//!
//! Configuration structs live next to the code that consumes them; this crate
//! only knows how to turn a YAML file (with `${VAR}` placeholders) into one of
//! them.

pub mod loader;

pub use loader::*;
