pub mod codec;
pub mod config;
pub mod indicator_handler;
pub mod indicators;
pub mod worker;
