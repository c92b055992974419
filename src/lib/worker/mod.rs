pub mod api;
pub mod cpu;
pub mod listener;
pub mod runtime;
pub mod secrets;
pub mod shutdown;
pub mod stats;
