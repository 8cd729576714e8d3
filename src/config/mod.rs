//! Configuration is layered: the built-in `default.toml`, an optional user file
//! merged over it, and finally command line arguments.

pub mod file;
pub mod runtime;

pub use runtime::Options;
