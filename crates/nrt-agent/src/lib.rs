//! The aggregator agent: configuration, receiver adapters, the vector-store
//! exporter, and the topology runtime that wires them into running pipelines.
//!
//! The library surface exists so integration tests can drive the topology
//! directly; the `nrt-agent` binary is a thin wrapper around
//! [`config::load_config`] and [`topology::run`].

pub mod builder;
pub mod config;
pub mod exporters;
pub mod logger;
pub mod receivers;
pub mod topology;
