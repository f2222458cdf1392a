pub mod config;
pub mod daemon;
pub mod signals;
pub mod sync;
