//! Basic example demonstrating LarkDB Rust SDK usage.

use larkdb::{field, Direction, LarkDB, LarkOptions};
use serde_json::json;

#[tokio::main]
async fn main() -> larkdb::Result<()> {
  // The api key is the base64-encoded host of your database endpoint;
  // "bG9jYWxob3N0OjgwOTA=" is "localhost:8090".
  let db = LarkDB::with_options(
    LarkOptions::new("bG9jYWxob3N0OjgwOTA=").with_cache(),
  )?;

  let messages = db.collection("messages");

  // Insert a couple of messages
  messages
    .new_document()
    .mutate(json!({ "author": "alice", "text": "hi" }))
    .await?;
  messages
    .new_document()
    .mutate(json!({ "author": "bob", "text": "yo" }))
    .await?;

  // One-shot query
  let from_alice = messages
    .clone()
    .filter(field("author").eq("alice"))
    .fetch()
    .await?;
  println!("{} message(s) from alice", from_alice.len());

  // Live view of the ten most recent messages
  println!("\nWatching messages (Ctrl+C to exit)...\n");
  let mut sub = messages
    .order("$modified", Direction::Desc)
    .take(10)
    .subscribe()
    .await?;

  while let Some(update) = sub.next().await {
    let update = update?;
    for doc in &update.inserted {
      if let Some(value) = &doc.value {
        println!(
          "[{}] {}",
          value.get("author").and_then(|v| v.as_str()).unwrap_or("?"),
          value.get("text").and_then(|v| v.as_str()).unwrap_or(""),
        );
      }
    }
    for doc in &update.removed {
      println!("(removed {})", doc.id);
    }
  }

  Ok(())
}
