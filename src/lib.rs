//! Real-time collaborative form filling over WebSockets.
//!
//! The crate is split so integration tests can drive the engine
//! directly: [`collab::CollabEngine`] holds all room, lock, and
//! broadcast semantics against a pluggable [`db::CollabStore`], and the
//! axum layer in [`handlers`] / [`routes`] is a thin shell around it.

pub mod collab;
pub mod config;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

pub use collab::registry::{RoomRegistry, SessionHandle};
pub use collab::CollabEngine;
pub use db::{CollabStore, MemStore, PgStore};
