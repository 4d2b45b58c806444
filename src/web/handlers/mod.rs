pub mod health;
pub mod queue;
pub mod sync;
