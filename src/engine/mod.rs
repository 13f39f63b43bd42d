// Lorekeep Runtime — Engine Layer
//
// Everything with behavior lives under engine/. The atoms layer supplies
// types and trait seams; this layer supplies the store, the event bus,
// provider adapters, and the four subsystems (automation, chat, missions,
// indexing) plus the ingestion server.

pub mod automation;
pub mod chat;
pub mod context;
pub mod embedding;
pub mod events;
pub mod http;
pub mod ingest;
pub mod kb_blocks;
pub mod mission;
pub mod oauth;
pub mod providers;
pub mod runtime;
pub mod secrets;
pub mod store;
pub mod tools;
pub mod types;
