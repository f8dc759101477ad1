//! Application layer shared by the HTTP surface and the binary.

pub mod error;
