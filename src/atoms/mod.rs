// ── Lorekeep Atoms Layer ───────────────────────────────────────────────────
// Pure constants, data types, error types, and trait seams — zero side
// effects, no I/O. Dependency rule: atoms may only depend on std and
// external pure crates. Nothing here may import from engine/.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
