pub mod collector;

pub use collector::{GarbageCollector, GcEvent, GcManager};
