//! # Mission API
//!
//! REST client for the mission report backend.
//!
//! This crate provides:
//! - The [`RemoteApi`] trait the sync engine drains its queue against
//! - An HTTP implementation ([`HttpRemoteApi`]) over reqwest with JSON bodies
//!   and multipart photo uploads
//! - Error classification into transient and permanent failures
//! - Bearer-token delegation through [`TokenProvider`]
//!
//! ## Separation of Concerns
//!
//! This crate does **not**:
//! - Store reports or queue entries (handled by the application)
//! - Retry failed calls (the sync manager decides what to retry)
//! - Refresh credentials itself (delegated to the auth collaborator)
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use mission_api::{HttpRemoteApi, RemoteApi, StaticToken};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let tokens = Arc::new(StaticToken::new(Some("secret".to_string())));
//! let api = HttpRemoteApi::new("https://api.example.com/v1", tokens, Duration::from_secs(30))?;
//! api.ping().await?;
//! ```

pub mod auth;
pub mod models;
pub mod service;

pub use auth::{StaticToken, TokenProvider};
pub use models::{PhotoUpload, RemoteReport, UploadedPhoto};
pub use service::{ApiError, HttpRemoteApi, RemoteApi};
