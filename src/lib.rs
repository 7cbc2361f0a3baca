//! Offline-first synchronization core: verified connectivity, a durable local
//! table store, a request cache, a persistent mutation queue and the engine
//! that replays it.

pub mod accessor;
pub mod app;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod event;
pub mod query;
pub mod queue;
pub mod remote;
pub mod row;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;
