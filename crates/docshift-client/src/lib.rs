//! docshift client - HTTP store client for the migration engine.
//!
//! [`HttpStore`] implements [`docshift_core::StoreClient`] over the
//! Elasticsearch REST API: `_cat/indices`, scroll searches, `_bulk` and
//! single-document requests.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use docshift_client::{ClientConfig, HttpStore};
//! use docshift_core::StoreClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(HttpStore::new(ClientConfig::localhost())?);
//!     store.ping().await?;
//!
//!     for index in store.list_indices().await? {
//!         println!("{} {:?}", index.index, index.doc_count());
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::HttpStore;
pub use config::ClientConfig;
pub use error::Error;
