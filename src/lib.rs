//! LarkDB Rust Client SDK
//!
//! A realtime document database client over a single persistent WebSocket
//! connection: subscribe to queries, fetch, mutate, merge, delete, and
//! authenticate, with automatic reconnection and an optional on-disk cache
//! for offline reads.
//!
//! # Example
//!
//! ```no_run
//! use larkdb::{field, Direction, ExecutionResult, LarkDB};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> larkdb::Result<()> {
//!     let db = LarkDB::with_api_key("bG9jYWxob3N0OjgwOTA=")?;
//!
//!     // Write a document
//!     let messages = db.collection("messages");
//!     messages
//!         .new_document()
//!         .mutate(json!({ "text": "hello", "author": "alice" }))
//!         .await?;
//!
//!     // Subscribe to the ten most recent messages
//!     let mut sub = messages
//!         .clone()
//!         .order("$modified", Direction::Desc)
//!         .take(10)
//!         .subscribe()
//!         .await?;
//!
//!     while let Some(update) = sub.next().await {
//!         let update = update?;
//!         for doc in &update.inserted {
//!             println!("new message: {:?}", doc.value);
//!         }
//!     }
//!
//!     // Optimistic concurrency
//!     messages
//!         .document("counter")
//!         .execute(|current| {
//!             let n = current
//!                 .and_then(|v| v.get("n"))
//!                 .and_then(|n| n.as_i64())
//!                 .unwrap_or(0);
//!             ExecutionResult::Write(json!({ "n": n + 1 }))
//!         })
//!         .await?;
//!
//!     // Filtered fetch
//!     let from_alice = messages
//!         .clone()
//!         .filter(field("author").eq("alice"))
//!         .fetch()
//!         .await?;
//!     println!("{} messages from alice", from_alice.len());
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod document;
pub mod error;
pub mod network;
pub mod protocol;
pub mod query;

mod client;
mod session;
mod subscription;

pub use client::{
  CollectionRef, DocumentRef, ExecutionResult, LarkDB, LarkOptions, Subscription,
};
pub use document::Document;
pub use error::{Error, ExecutionErrorKind, InvalidDataKind, Result};
pub use network::{Connector, TransportEvent, TransportHandle, WsConnector};
pub use protocol::{ClientRequest, ServerMessage, SubscriptionBatch, WriteDocument};
pub use query::{
  and, field, not, or, Direction, Field, Filter, Ordering, Paging, Query,
};
pub use subscription::SubscriptionUpdate;
