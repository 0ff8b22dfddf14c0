pub mod config;
pub mod probe;
pub mod up;

pub use config::Config;
pub use probe::Probe;
pub use up::Up;
