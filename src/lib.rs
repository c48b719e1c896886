//! Rust client SDK for Pendulum collections and realtime change events.
//!
//! The crate is organized by surface:
//! - `client`: [`PendulumClient`], the entry point owning every other part.
//! - `db`: CRUD calls whose mutations are tagged for echo suppression.
//! - `auth`: register, login, and logout.
//! - `stream`: realtime change stream with topic subscriptions.
//! - `echo`: registry that drops change events caused by this client.
//! - `credentials`: stores for the auth token and admin key.
//! - `retry`: reconnect backoff policy.

/// Registration and session calls.
pub mod auth;
/// Top-level client and options.
pub mod client;
/// Auth token and admin key storage.
pub mod credentials;
/// Collection document CRUD.
pub mod db;
/// Echo suppression for local mutations.
pub mod echo;
/// Shared HTTP plumbing and API errors.
pub mod http;
/// Reconnect backoff policy.
pub mod retry;
/// Realtime stream client, event types, and transports.
pub mod stream;

pub use client::{CollectionPermissions, PendulumClient, PendulumClientOptions, DEFAULT_APP_URL};
pub use echo::{EchoConfig, EchoSuppressor};
pub use http::ApiError;
pub use stream::client::{CloseReason, ConnectionState, StreamClient, StreamConfig};
pub use stream::event::{ChangeAction, ChangeEvent, ChangePayload};
pub use stream::registry::{callback, ChangeCallback};
