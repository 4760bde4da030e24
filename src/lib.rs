//! Session-scoped chat with polling synchronization.
//!
//! The daemon (`src/main.rs`) serves the conversation store over HTTP. The
//! visitor and operator sides of the conversation are driven by
//! [`client::ClientSyncEngine`] and [`admin::AdminSyncEngine`], which talk to
//! the store through any [`api::ConversationApi`].

pub mod admin;
pub mod api;
pub mod bus;
pub mod chat;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod identity;
pub mod merge;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;
