//! # CrewRun
//!
//! Worker orchestration over [`crewrpc`] envelopes: spawn or adopt
//! isolated execution units, call routes on them with correlated
//! replies, broker direct worker-to-worker channels, and pipe route
//! outputs between workers with optional blocking backpressure.
//!
//! The entry point is [`Registry`]: one per execution unit, holding the
//! dispatch table and the roster of attached workers. Workers spawned
//! through a registry host a registry of their own, so every unit speaks
//! the same protocol and any unit can coordinate others.

pub mod broker;
pub mod duplex;
pub mod engine;
pub mod pubsub;
pub mod registry;
pub mod transport;
pub mod worker;

pub use duplex::DuplexTransport;
pub use engine::Context;
pub use engine::Engine;
pub use engine::SubscribeInput;
pub use pubsub::SubscribeTarget;
pub use registry::Registry;
pub use registry::WorkerSpec;
pub use transport::Packet;
pub use transport::Transport;
pub use worker::WorkerHandle;

#[cfg(test)]
mod tests;
