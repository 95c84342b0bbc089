pub mod btle;
pub mod connection;
pub mod constants;
pub mod debouncer;
pub mod decoder;
pub mod machine;
pub mod queue;
pub mod scanner;
pub mod scripted;
pub mod signals;
pub mod transport;
pub mod types;
