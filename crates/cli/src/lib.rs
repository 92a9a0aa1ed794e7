//! Terminal rendering and the HTTP API for the `finrag` binary.
pub mod render;
pub mod server;
