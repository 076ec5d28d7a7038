pub mod buffer;
pub mod offset_count;
pub mod statemachine;
