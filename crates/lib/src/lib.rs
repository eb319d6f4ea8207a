//! Docchat client core: session and token handling, the REST gateway, the
//! realtime chat channel and document operations, used by the CLI.

pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod documents;
pub mod error;
pub mod gateway;
pub mod models;
pub mod realtime;
pub mod retry;
pub mod session;
pub mod token;

pub use client::Client;
pub use error::ClientError;
