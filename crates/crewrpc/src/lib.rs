//! # CrewRPC
//!
//! The wire layer of the crew orchestration stack: message envelopes,
//! correlation ids, payload values, and transferable-buffer detection.
//!
//! ## Architecture
//!
//! An [`Envelope`] names an operation (`route`) on the receiving side and
//! optionally carries a correlation id. An envelope with a `callback_id`
//! and no `route` is a reply. Payloads are [`Value`]s: JSON-compatible
//! structured data plus an opaque binary-buffer variant that transports
//! may move by ownership instead of copying.

pub mod envelope;
pub mod transfer;
pub mod value;

pub use envelope::CallbackId;
pub use envelope::Envelope;
pub use value::Value;

#[cfg(test)]
mod tests;
