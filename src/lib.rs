//! # Railyard
//!
//! Publishing and distribution control plane for builds released through
//! staged rollout channels. Usable both as a standalone binary and as a
//! library.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use railyard::clock::SystemClock;
//! use railyard::config::ServerConfig;
//! use railyard::server::{AppState, create_router};
//! use railyard::store::{SqliteStore, Store};
//!
//! let config = ServerConfig::default();
//! let store = SqliteStore::new(config.db_path()).unwrap();
//! store.initialize().unwrap();
//!
//! let state = Arc::new(AppState::new(&config, Arc::new(store), Arc::new(SystemClock)).unwrap());
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `railyard` binary. Disable with `default-features = false`.

pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod registry;
pub mod resolution;
pub mod retry;
pub mod server;
pub mod storage;
pub mod store;
pub mod types;
