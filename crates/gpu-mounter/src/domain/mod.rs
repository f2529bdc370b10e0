pub mod allocator;
pub mod compat;
pub mod errors;
pub mod orchestrator;
pub mod reaper;
pub mod reconcile;
pub mod resource;
pub mod traits;
