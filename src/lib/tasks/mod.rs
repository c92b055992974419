pub mod docker;
pub mod execution;
pub mod log;
pub mod payload;
pub mod scopes;
pub mod state;
pub mod types;
