pub mod engine;
pub mod slot;

pub use engine::FusionEngine;
pub use slot::PendingSlot;
