// Lorekeep — a desktop knowledge-automation runtime.
//
// Executes user-defined automations against domain-scoped knowledge bases,
// routes LLM chat through a tool-augmented pipeline, and runs long-lived
// missions with human approval gates. Single user, single host; all state
// is local SQLite.
//
// Layering:
//   atoms/  — pure data types, constants, error enum, trait seams
//   engine/ — store, event bus, providers, and the runtime subsystems
//
// The embedding application constructs a `Runtime`, calls `init()` then
// `start()`, and drives chat/missions through the handle. See DESIGN.md
// for the component map.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::traits::{MailPort, Provider, SecretStore, TaskListPort, UiSink};
pub use engine::runtime::{CancelToken, Runtime};
pub use engine::store::Store;
pub use engine::types::RuntimeConfig;
