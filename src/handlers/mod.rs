pub mod asr;
pub mod config;

pub use asr::*;
pub use config::*;
