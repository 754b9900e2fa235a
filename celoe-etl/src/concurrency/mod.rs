pub mod coordinator;
pub mod memory_guard;
