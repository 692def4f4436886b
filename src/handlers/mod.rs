pub mod config;
pub mod index;

pub use config::*;
pub use index::*;
