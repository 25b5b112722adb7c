//! Core processing stages for the near-real-time telemetry aggregator.
//!
//! This crate holds everything that touches telemetry data after it has been
//! received and before it is exported: the envelope/observation/aggregate
//! data model, the payload decoders, the windowed summarizer with its
//! streaming quantile digest, the online anomaly scorer, the vectorizer, and
//! the aggregate filter. The component contracts (receiver, processor,
//! exporter) live here too so that adapter crates only depend on `nrt-core`.
//!
//! # Architecture
//!
//! ```text
//! receiver ──> Envelope ──> decode ──> Observation ──> summarizer ──> Aggregate
//!                                                                        │
//!                         exporter <── filter <── vectorizer <── anomaly ─┘
//! ```
//!
//! Every stage is an independent task connected by bounded channels; the
//! stage values travel as the [`model::StageValue`] tagged variant and each
//! stage silently drops variants it does not understand.

pub mod anomaly;
pub mod clock;
pub mod component;
pub mod decode;
pub mod digest;
pub mod filter;
pub mod model;
pub mod summarizer;
pub mod vectorizer;
