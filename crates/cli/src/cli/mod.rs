pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Config, Probe, Up};
