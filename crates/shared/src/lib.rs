//! Domain types shared by the engine, its storage and its tools.

pub mod domain;
pub mod error;
pub mod protocol;
