// flowpresence-common: shared types and wire protocol for flow presence

pub mod color;
pub mod protocol;
pub mod types;
