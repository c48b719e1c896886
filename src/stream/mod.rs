//! Realtime change stream modules.
//!
//! - `client`: connection worker, reconnect handling, and topic fan-out.
//! - `event`: change event wire format and per-action payloads.
//! - `registry`: topic to subscriber bookkeeping.
//! - `sse`: incremental server-sent events decoder.
//! - `transport`: push stream transports (SSE and websocket).

/// Stream client and connection state.
pub mod client;
/// Change event types.
pub mod event;
/// Subscriber callbacks and the per-topic registry.
pub mod registry;
/// Server-sent events framing.
pub mod sse;
/// Transports that open a push stream of text frames.
pub mod transport;
