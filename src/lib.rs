//! # Mission Sync
//!
//! Offline-first storage and synchronization for roof-cleaning mission reports.
//!
//! This crate provides:
//! - A durable local store (SQLite) for reports, photos and the sync queue
//! - Queue collapse rules so the server only sees complete, ordered edits
//! - The sync manager state machine draining the queue against [`mission_api`]
//! - A connectivity monitor that triggers syncs on offline→online edges
//! - A bridge invalidating the UI query cache after each drain cycle
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use mission_sync::services::{ConnectivityMonitor, LocalStore, SyncManager};
//! use mission_sync::models::SyncTrigger;
//!
//! let store = LocalStore::new();
//! store.init(&config.database_path, config.store_open_timeout()).await;
//! let manager = SyncManager::new(store.clone(), api, ConnectivityMonitor::new(true), &config);
//! let result = manager.sync(SyncTrigger::Manual).await;
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod services;

pub use config::SyncConfig;
pub use error::AppError;
