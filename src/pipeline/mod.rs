// The staged pipeline: N rows advance through TAR -> UPLOAD -> CREATE ->
// SUBMIT with bounded worker pools per stage and a durable per-row state
// journal that makes arbitrary interruption resumable.

pub mod engine;
pub mod rows;
pub mod state;
