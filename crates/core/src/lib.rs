//! metersync core: the engines of an edge agent that polls BACnet meters,
//! buffers readings in a local PostgreSQL outbox, uploads them to the remote
//! Client System, and mirrors configuration back down.

pub mod bacnet;
pub mod cache;
pub mod collect;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod guard;
pub mod model;
pub mod outbox;
pub mod remote;
pub mod startup;
pub mod supervisor;
pub mod upload;
pub mod worker_metrics;

#[cfg(test)]
pub mod test_support;

pub use config::AgentConfig;
pub use error::AgentError;
pub use supervisor::Supervisor;
