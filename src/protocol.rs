//! Wire protocol types and serialization for LarkDB.
//!
//! Every frame is a UTF-8 text message holding one JSON object with exactly
//! one top-level key naming the variant. Outbound payloads always carry an
//! `evt-id`; inbound frames reference a prior `evt-id` (`ack`, `err`) or
//! declare their own subscription/fetch id. A server `batch` envelope wraps a
//! sequence of inner frames.

use serde_json::{json, Map, Value};

use crate::document::Document;
use crate::error::{Error, InvalidDataKind, Result};
use crate::query::{Query, MAX_TAKE};

/// Default timeout for requests that always time out (connection requests).
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Interval of the no-op heartbeat round trip.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Body of a `mut`/`mer` request: the client-side view of a document write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteDocument {
  pub id: String,
  pub etag: Option<String>,
  pub body: Map<String, Value>,
}

/// A client-to-server request, before an event id is assigned.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
  Connect { connection_id: String },
  Reconnect { connection_id: String },
  Disconnect,
  NoOp,
  Authorize { token: String },
  Deauthorize,
  Mutate { collection_id: String, document: WriteDocument },
  Merge { collection_id: String, document: WriteDocument },
  Delete { collection_id: String, id: String, etag: Option<String> },
  Subscribe { subscription_id: String, collection_id: String, query: Query },
  Unsubscribe { subscription_id: String },
  Fetch { fetch_id: String, collection_id: String, query: Query },
  /// Client-side acknowledgement of a server-sent subscription event.
  Ack { event_id: String },
}

impl ClientRequest {
  /// Connection requests bind to one physical connection and are dropped
  /// from the queue on disconnect.
  pub fn is_connection_bound(&self) -> bool {
    matches!(
      self,
      ClientRequest::Connect { .. } | ClientRequest::Reconnect { .. } | ClientRequest::NoOp
    )
  }

  /// Connect/reconnect always carry the default timeout and trigger a
  /// transport restart when it elapses.
  pub fn is_connection_request(&self) -> bool {
    matches!(self, ClientRequest::Connect { .. } | ClientRequest::Reconnect { .. })
  }

  /// Whether the server answers this request with `ack`/`err`.
  pub fn expects_ack(&self) -> bool {
    !matches!(self, ClientRequest::Disconnect | ClientRequest::Ack { .. })
  }

  /// Serializes the request into a single-key envelope carrying `event_id`.
  ///
  /// Identifier, key-path, document, and limit validation happen here;
  /// failures never reach the transport.
  pub fn serialize(&self, event_id: &str) -> Result<String> {
    let frame = match self {
      ClientRequest::Connect { connection_id } => {
        json!({ "con": { "evt-id": event_id, "con-id": connection_id } })
      }
      ClientRequest::Reconnect { connection_id } => {
        json!({ "rec": { "evt-id": event_id, "con-id": connection_id } })
      }
      ClientRequest::Disconnect => json!({ "dis": { "evt-id": event_id } }),
      ClientRequest::NoOp => json!({ "nop": { "evt-id": event_id } }),
      ClientRequest::Authorize { token } => {
        json!({ "auth": { "evt-id": event_id, "token": token } })
      }
      ClientRequest::Deauthorize => json!({ "deauth": { "evt-id": event_id } }),
      ClientRequest::Mutate { collection_id, document } => {
        json!({ "mut": write_payload(event_id, collection_id, document)? })
      }
      ClientRequest::Merge { collection_id, document } => {
        json!({ "mer": write_payload(event_id, collection_id, document)? })
      }
      ClientRequest::Delete { collection_id, id, etag } => {
        validate_identifier(collection_id)?;
        validate_identifier(id)?;
        let mut doc = json!({ "id": id });
        if let Some(etag) = etag {
          doc["etag"] = json!(etag);
        }
        json!({ "del": { "evt-id": event_id, "col-id": collection_id, "doc": doc } })
      }
      ClientRequest::Subscribe { subscription_id, collection_id, query } => {
        let mut payload = query_payload(event_id, collection_id, query)?;
        payload.insert("sub-id".to_string(), json!(subscription_id));
        json!({ "sub": payload })
      }
      ClientRequest::Unsubscribe { subscription_id } => {
        json!({ "uns": { "evt-id": event_id, "sub-id": subscription_id } })
      }
      ClientRequest::Fetch { fetch_id, collection_id, query } => {
        let mut payload = query_payload(event_id, collection_id, query)?;
        payload.insert("ftc-id".to_string(), json!(fetch_id));
        json!({ "ftc": payload })
      }
      ClientRequest::Ack { event_id } => json!({ "ack": { "evt-id": event_id } }),
    };
    serde_json::to_string(&frame).map_err(Error::from)
  }
}

fn write_payload(event_id: &str, collection_id: &str, document: &WriteDocument) -> Result<Value> {
  validate_identifier(collection_id)?;
  validate_identifier(&document.id)?;
  validate_document(&document.body)?;
  let mut doc = json!({ "id": document.id, "body": document.body });
  if let Some(etag) = &document.etag {
    doc["etag"] = json!(etag);
  }
  Ok(json!({ "evt-id": event_id, "col-id": collection_id, "doc": doc }))
}

fn query_payload(event_id: &str, collection_id: &str, query: &Query) -> Result<Map<String, Value>> {
  validate_identifier(collection_id)?;
  if let Some(filter) = &query.filter {
    for path in filter.key_paths() {
      validate_key_path(path)?;
    }
  }
  for ordering in &query.ordering {
    validate_key_path(&ordering.key_path)?;
  }
  if let Some(take) = query.paging.take {
    if take > MAX_TAKE {
      return Err(Error::InvalidData(InvalidDataKind::InvalidLimit));
    }
  }

  let mut payload = Map::new();
  payload.insert("evt-id".to_string(), json!(event_id));
  payload.insert("col-id".to_string(), json!(collection_id));
  if let Some(filter) = &query.filter {
    payload.insert("filter".to_string(), filter.to_json());
  }
  if let Some(order) = query.ordering_json() {
    payload.insert("order".to_string(), order);
  }
  if let Some(take) = query.paging.take {
    payload.insert("limit".to_string(), json!(take));
  }
  if let Some(skip) = query.paging.skip {
    payload.insert("skip".to_string(), json!(skip));
  }
  Ok(payload)
}

/// A batch of subscription events merged by the codec.
///
/// A full snapshot supersedes whatever was buffered before it; deltas append
/// in order. All constituent event ids are kept for bulk acknowledgement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionBatch {
  pub collection: Option<Vec<Document>>,
  pub updates: Vec<Document>,
  pub event_ids: Vec<String>,
}

impl SubscriptionBatch {
  fn merge_snapshot(&mut self, documents: Vec<Document>, event_id: Option<String>) {
    self.collection = Some(documents);
    self.updates.clear();
    self.event_ids.extend(event_id);
  }

  fn merge_update(&mut self, document: Document, event_id: Option<String>) {
    self.updates.push(document);
    self.event_ids.extend(event_id);
  }
}

/// Server-to-client messages after batch flattening and update collapse.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
  Ack {
    event_id: String,
  },
  Error {
    event_id: String,
    error: Error,
  },
  /// Consecutive `val`/`upd`/`rm` frames for one subscription, merged.
  Subscription {
    subscription_id: String,
    collection_id: String,
    batch: SubscriptionBatch,
  },
  /// Server-side cancellation (`ca`): the subscription lost its permission.
  SubscriptionCancel {
    subscription_id: String,
    collection_id: String,
  },
  FetchResponse {
    fetch_id: String,
    collection_id: String,
    documents: Vec<Document>,
  },
}

/// Parses one inbound text frame into a sequence of messages.
///
/// `batch` envelopes are flattened; consecutive subscription frames for the
/// same subscription id collapse into a single merged [`SubscriptionBatch`].
pub fn parse_server_messages(text: &str) -> Result<Vec<ServerMessage>> {
  let value: Value = serde_json::from_str(text)?;
  let frames = match envelope(&value)? {
    ("batch", Value::Array(inner)) => {
      let mut out = Vec::with_capacity(inner.len());
      for item in inner {
        out.push(envelope(item)?);
      }
      out
    }
    single => vec![single],
  };

  let mut messages: Vec<ServerMessage> = Vec::new();
  for (tag, payload) in frames {
    match tag {
      "val" | "upd" | "rm" => {
        let sub_id = required_str(payload, "sub-id")?;
        let col_id = required_str(payload, "col-id")?;
        let event_id = optional_str(payload, "evt-id");
        let mergeable = matches!(
          messages.last(),
          Some(ServerMessage::Subscription { subscription_id, .. }) if subscription_id.as_str() == sub_id
        );
        if !mergeable {
          messages.push(ServerMessage::Subscription {
            subscription_id: sub_id.to_string(),
            collection_id: col_id.to_string(),
            batch: SubscriptionBatch::default(),
          });
        }
        let Some(ServerMessage::Subscription { batch, .. }) = messages.last_mut() else {
          unreachable!()
        };
        match tag {
          "val" => {
            let docs = parse_documents(payload, "docs", col_id)?;
            batch.merge_snapshot(docs, event_id);
          }
          "upd" => {
            let doc = parse_document(required(payload, "doc")?, col_id)?;
            batch.merge_update(doc, event_id);
          }
          _ => {
            let mut doc = parse_document(required(payload, "doc")?, col_id)?;
            // A removal is a tombstone regardless of what the frame carried.
            doc.value = None;
            doc.etag = None;
            batch.merge_update(doc, event_id);
          }
        }
      }
      "ack" => messages.push(ServerMessage::Ack {
        event_id: required_str(payload, "evt-id")?.to_string(),
      }),
      "err" => {
        let event_id = required_str(payload, "evt-id")?.to_string();
        let err_type = required_str(payload, "err-type")?;
        let err_msg = optional_str(payload, "err-msg");
        messages.push(ServerMessage::Error {
          event_id,
          error: Error::from_wire(err_type, err_msg.as_deref()),
        });
      }
      "ca" => messages.push(ServerMessage::SubscriptionCancel {
        subscription_id: required_str(payload, "sub-id")?.to_string(),
        collection_id: required_str(payload, "col-id")?.to_string(),
      }),
      "res" => {
        let col_id = required_str(payload, "col-id")?;
        messages.push(ServerMessage::FetchResponse {
          fetch_id: required_str(payload, "ftc-id")?.to_string(),
          collection_id: col_id.to_string(),
          documents: parse_documents(payload, "docs", col_id)?,
        });
      }
      other => {
        log::warn!("ignoring unknown server frame: {}", other);
      }
    }
  }
  Ok(messages)
}

fn envelope(value: &Value) -> Result<(&str, &Value)> {
  let obj = value
    .as_object()
    .ok_or(Error::InvalidData(InvalidDataKind::SerializationFailure))?;
  let mut entries = obj.iter();
  match (entries.next(), entries.next()) {
    (Some((tag, payload)), None) => Ok((tag.as_str(), payload)),
    _ => Err(Error::InvalidData(InvalidDataKind::SerializationFailure)),
  }
}

fn required<'a>(payload: &'a Value, key: &str) -> Result<&'a Value> {
  payload
    .get(key)
    .ok_or(Error::InvalidData(InvalidDataKind::SerializationFailure))
}

fn required_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str> {
  required(payload, key)?
    .as_str()
    .ok_or(Error::InvalidData(InvalidDataKind::SerializationFailure))
}

fn optional_str(payload: &Value, key: &str) -> Option<String> {
  payload.get(key).and_then(Value::as_str).map(str::to_string)
}

fn parse_document(value: &Value, collection_id: &str) -> Result<Document> {
  let mut doc: Document = serde_json::from_value(value.clone())?;
  doc.collection_id = collection_id.to_string();
  Ok(doc)
}

fn parse_documents(payload: &Value, key: &str, collection_id: &str) -> Result<Vec<Document>> {
  let items = required(payload, key)?
    .as_array()
    .ok_or(Error::InvalidData(InvalidDataKind::SerializationFailure))?;
  items.iter().map(|v| parse_document(v, collection_id)).collect()
}

/// Identifier validation: non-empty, `[A-Za-z0-9_-]` only.
pub fn validate_identifier(id: &str) -> Result<()> {
  let valid = !id.is_empty()
    && id
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
  if valid {
    Ok(())
  } else {
    Err(Error::InvalidData(InvalidDataKind::InvalidIdentifierFormat))
  }
}

/// Key-path validation: dotted segments, each a valid identifier or one of
/// the special `$id`/`$created`/`$modified` paths.
pub fn validate_key_path(path: &str) -> Result<()> {
  use crate::query::{KEY_PATH_CREATED, KEY_PATH_ID, KEY_PATH_MODIFIED};
  if path.is_empty() {
    return Err(Error::InvalidData(InvalidDataKind::InvalidKeyPath));
  }
  for segment in path.split('.') {
    let special =
      segment == KEY_PATH_ID || segment == KEY_PATH_CREATED || segment == KEY_PATH_MODIFIED;
    if !special && validate_identifier(segment).is_err() {
      return Err(Error::InvalidData(InvalidDataKind::InvalidKeyPath));
    }
  }
  Ok(())
}

/// Document-body validation: recursively rejects any mapping key containing
/// a `.` (the key-path separator).
pub fn validate_document(body: &Map<String, Value>) -> Result<()> {
  for (key, value) in body {
    if key.contains('.') {
      return Err(Error::InvalidData(InvalidDataKind::InvalidDocument));
    }
    validate_value(value)?;
  }
  Ok(())
}

fn validate_value(value: &Value) -> Result<()> {
  match value {
    Value::Object(map) => validate_document(map),
    Value::Array(items) => items.iter().try_for_each(validate_value),
    _ => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_identifier_validation() {
    assert!(validate_identifier("msg_01-a").is_ok());
    assert!(validate_identifier("").is_err());
    assert!(validate_identifier("bad.id").is_err());
    assert!(validate_identifier("no spaces").is_err());
  }

  #[test]
  fn test_key_path_validation() {
    assert!(validate_key_path("user.address.city").is_ok());
    assert!(validate_key_path("$id").is_ok());
    assert!(validate_key_path("$modified").is_ok());
    assert!(validate_key_path("user..city").is_err());
    assert!(validate_key_path("").is_err());
    assert!(validate_key_path("$bogus").is_err());
  }

  #[test]
  fn test_document_validation_rejects_dotted_keys() {
    let ok: Map<String, Value> = serde_json::from_str(r#"{"a": {"b": [{"c": 1}]}}"#).unwrap();
    assert!(validate_document(&ok).is_ok());

    let bad: Map<String, Value> = serde_json::from_str(r#"{"a": {"b.c": 1}}"#).unwrap();
    assert_eq!(
      validate_document(&bad),
      Err(Error::InvalidData(InvalidDataKind::InvalidDocument))
    );
  }

  #[test]
  fn test_batch_collapse_merges_consecutive_updates() {
    let text = r#"{"batch": [
      {"upd": {"evt-id": "e1", "sub-id": "s1", "col-id": "msg", "doc": {"id": "a", "etag": "t1", "body": {"n": 1}}}},
      {"upd": {"evt-id": "e2", "sub-id": "s1", "col-id": "msg", "doc": {"id": "b", "etag": "t2", "body": {"n": 2}}}},
      {"ack": {"evt-id": "e0"}}
    ]}"#;
    let messages = parse_server_messages(text).unwrap();
    assert_eq!(messages.len(), 2);
    match &messages[0] {
      ServerMessage::Subscription { subscription_id, batch, .. } => {
        assert_eq!(subscription_id, "s1");
        assert!(batch.collection.is_none());
        assert_eq!(batch.updates.len(), 2);
        assert_eq!(batch.event_ids, vec!["e1", "e2"]);
      }
      other => panic!("expected merged subscription batch, got {:?}", other),
    }
  }

  #[test]
  fn test_snapshot_supersedes_buffered_updates() {
    let text = r#"{"batch": [
      {"upd": {"evt-id": "e1", "sub-id": "s1", "col-id": "msg", "doc": {"id": "a", "etag": "t1", "body": {}}}},
      {"val": {"evt-id": "e2", "sub-id": "s1", "col-id": "msg", "docs": [{"id": "b", "etag": "t2", "body": {}}]}}
    ]}"#;
    let messages = parse_server_messages(text).unwrap();
    assert_eq!(messages.len(), 1);
    match &messages[0] {
      ServerMessage::Subscription { batch, .. } => {
        assert_eq!(batch.collection.as_ref().unwrap().len(), 1);
        assert!(batch.updates.is_empty());
        assert_eq!(batch.event_ids, vec!["e1", "e2"]);
      }
      other => panic!("expected subscription batch, got {:?}", other),
    }
  }
}
