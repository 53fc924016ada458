//! # compute-engine
//!
//! Background task execution core of the compute engine.
//!
//! A bounded pool of workers polls a durable task queue, claims at most one
//! task per worker at a time, dispatches it to the processor registered for
//! its type, and records the terminal outcome. Sizing comes from
//! [`config::CeConfiguration`]; the per-cycle logic lives in [`worker`].

pub mod config;
pub mod error;
pub mod listener;
pub mod model;
pub mod pool;
pub mod processor;
pub mod queue;
pub mod telemetry;
pub mod worker;
