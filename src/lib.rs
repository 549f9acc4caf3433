//! # docq
//!
//! Durable work-item lifecycle engine for document enrichment.
//!
//! Documents are admitted into a priority queue, run through an ordered
//! pipeline of pluggable stages, tracked stage by stage in a processing
//! ledger, replayed from their last checkpoint by a recovery engine when
//! they fail, and archived in a completion ledger when they finish. All
//! state lives in JSON documents under one data directory.

pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod stage;
pub mod store;
pub mod telemetry;
