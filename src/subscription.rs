//! Subscription handler: ordered dataset maintenance and change diffing.
//!
//! One handler represents one server-side subscription and fans out to every
//! listener that subscribed with the same query hash. Incoming batches are
//! either a full snapshot, a sequence of per-document deltas, or both; the
//! handler folds them into its last-known dataset and classifies every
//! affected document as inserted, updated, or removed.
//!
//! Ordering is maintained through the server-issued `sort_keys`/`sort_value`
//! tokens; the client never interprets the underlying values.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::protocol::SubscriptionBatch;
use crate::query::{Direction, Ordering, Query};

/// One delivery to subscription listeners: the full dataset plus the
/// documents that changed since the previous delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub documents: Vec<Document>,
    pub inserted: Vec<Document>,
    pub updated: Vec<Document>,
    pub removed: Vec<Document>,
}

/// Lifecycle of a server-side subscription registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionState {
    Registering,
    Subscribed,
    Unsubscribing,
}

/// One attached consumer of the handler's deliveries.
pub(crate) struct Listener {
    pub id: u64,
    pub tx: mpsc::UnboundedSender<Result<SubscriptionUpdate>>,
}

pub(crate) struct SubscriptionHandler {
    pub subscription_id: String,
    pub collection_id: String,
    pub query: Query,
    pub hash: String,
    pub state: SubscriptionState,
    /// Creation order, used to resubscribe in registration order.
    pub registration_seq: u64,
    listeners: Vec<Listener>,
    last_value: Option<Vec<Document>>,
    delivered_once: bool,
}

impl SubscriptionHandler {
    pub fn new(
        subscription_id: String,
        collection_id: String,
        query: Query,
        hash: String,
        registration_seq: u64,
    ) -> Self {
        Self {
            subscription_id,
            collection_id,
            query,
            hash,
            state: SubscriptionState::Registering,
            registration_seq,
            listeners: Vec::new(),
            last_value: None,
            delivered_once: false,
        }
    }

    /// Attaches a listener. If a value is already known it is replayed to the
    /// new listener immediately, as a full snapshot.
    pub fn add_listener(&mut self, listener: Listener) {
        if let Some(documents) = &self.last_value {
            let _ = listener.tx.send(Ok(SubscriptionUpdate {
                documents: documents.clone(),
                inserted: documents.clone(),
                updated: Vec::new(),
                removed: Vec::new(),
            }));
        }
        self.listeners.push(listener);
    }

    /// Detaches a listener; returns true when none remain.
    pub fn remove_listener(&mut self, listener_id: u64) -> bool {
        self.listeners.retain(|l| l.id != listener_id);
        self.listeners.is_empty()
    }

    /// Folds a server batch into the dataset. Returns the new dataset when a
    /// delivery happened, for the caller to push into the cache.
    pub fn ingest(&mut self, batch: &SubscriptionBatch) -> Option<Vec<Document>> {
        let first = !self.delivered_once;
        let (documents, update) = apply_batch(
            self.last_value.take(),
            batch,
            &self.query.ordering,
            self.query.paging.take,
            first,
        );
        self.last_value = Some(documents.clone());
        match update {
            Some(update) => {
                self.delivered_once = true;
                self.deliver(Ok(update));
                Some(documents)
            }
            None => None,
        }
    }

    /// Replays a cached dataset, but only while no server value has arrived.
    pub fn ingest_cached(&mut self, documents: Vec<Document>) {
        if self.last_value.is_some() {
            return;
        }
        let batch = SubscriptionBatch {
            collection: Some(documents),
            updates: Vec::new(),
            event_ids: Vec::new(),
        };
        self.ingest(&batch);
    }

    /// Delivers a terminal error to every listener.
    pub fn fail(&mut self, error: Error) {
        self.deliver(Err(error));
    }

    fn deliver(&mut self, result: Result<SubscriptionUpdate>) {
        self.listeners
            .retain(|l| l.tx.send(result.clone()).is_ok());
    }
}

/// Classification of one document within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Add,
    Update,
    Remove,
    Unchanged,
}

/// Reconciles a previous classification with a newer one for the same
/// document. `None` means the entry cancels out entirely (added then removed
/// within one batch).
fn merge_change(prev: Change, next: Change) -> Option<Change> {
    use Change::*;
    match (prev, next) {
        (Add, Remove) => None,
        (Add, _) => Some(Add),
        (Update, Remove) => Some(Remove),
        (Update, _) => Some(Update),
        (Remove, Add) | (Remove, Update) => Some(Update),
        (Remove, _) => Some(Remove),
        (Unchanged, next) => Some(next),
    }
}

/// Applies one batch to the previous dataset, producing the new dataset and,
/// when anything changed (or on first delivery), the classified change sets.
fn apply_batch(
    old: Option<Vec<Document>>,
    batch: &SubscriptionBatch,
    ordering: &[Ordering],
    take: Option<u32>,
    first_delivery: bool,
) -> (Vec<Document>, Option<SubscriptionUpdate>) {
    let mut ops: HashMap<String, Change> = HashMap::new();
    let mut removed_docs: HashMap<String, Document> = HashMap::new();
    let mut removal_order: Vec<String> = Vec::new();

    let mut documents: Vec<Document> = match (&batch.collection, old) {
        (Some(snapshot), Some(old_docs)) => {
            let documents: Vec<Document> = snapshot
                .iter()
                .filter(|d| !d.is_tombstone())
                .cloned()
                .collect();
            // Everything in the old dataset is tentatively removed, then each
            // snapshot document overrides its own tentative classification.
            for doc in &old_docs {
                ops.insert(doc.id.clone(), Change::Remove);
                removed_docs.insert(doc.id.clone(), doc.clone());
                removal_order.push(doc.id.clone());
            }
            for doc in &documents {
                let change = match old_docs.iter().find(|d| d.id == doc.id) {
                    Some(existing) if existing.etag == doc.etag => Change::Unchanged,
                    Some(_) => Change::Update,
                    None => Change::Add,
                };
                ops.insert(doc.id.clone(), change);
                removed_docs.remove(&doc.id);
            }
            documents
        }
        (Some(snapshot), None) => {
            let documents: Vec<Document> = snapshot
                .iter()
                .filter(|d| !d.is_tombstone())
                .cloned()
                .collect();
            for doc in &documents {
                ops.insert(doc.id.clone(), Change::Add);
            }
            documents
        }
        (None, old_docs) => old_docs.unwrap_or_default(),
    };

    for doc in &batch.updates {
        let outcome = incorporate(doc, &mut documents, ordering);
        let (change, removed) = match outcome {
            Incorporate::Unchanged => (Change::Unchanged, None),
            Incorporate::Added => (Change::Add, None),
            Incorporate::Updated => (Change::Update, None),
            Incorporate::Removed(old_doc) => (Change::Remove, Some(old_doc)),
        };
        record(change, doc.id.clone(), removed, &mut ops, &mut removed_docs, &mut removal_order);
    }

    // Bounded window: anything past `take` falls out as removed.
    if let Some(take) = take {
        let take = take as usize;
        if documents.len() > take {
            for doc in documents.split_off(take) {
                record(
                    Change::Remove,
                    doc.id.clone(),
                    Some(doc),
                    &mut ops,
                    &mut removed_docs,
                    &mut removal_order,
                );
            }
        }
    }

    let inserted: Vec<Document> = documents
        .iter()
        .filter(|d| ops.get(&d.id) == Some(&Change::Add))
        .cloned()
        .collect();
    let updated: Vec<Document> = documents
        .iter()
        .filter(|d| ops.get(&d.id) == Some(&Change::Update))
        .cloned()
        .collect();
    let removed: Vec<Document> = removal_order
        .iter()
        .filter(|id| ops.get(*id) == Some(&Change::Remove))
        .filter_map(|id| removed_docs.get(id).cloned())
        .collect();

    let changed = !inserted.is_empty() || !updated.is_empty() || !removed.is_empty();
    if changed || first_delivery {
        let update = SubscriptionUpdate { documents: documents.clone(), inserted, updated, removed };
        (documents, Some(update))
    } else {
        (documents, None)
    }
}

fn record(
    change: Change,
    id: String,
    removed: Option<Document>,
    ops: &mut HashMap<String, Change>,
    removed_docs: &mut HashMap<String, Document>,
    removal_order: &mut Vec<String>,
) {
    if change == Change::Unchanged && !ops.contains_key(&id) {
        return;
    }
    let merged = match ops.get(&id) {
        Some(prev) => merge_change(*prev, change),
        None => Some(change),
    };
    match merged {
        Some(Change::Remove) => {
            if let Some(doc) = removed {
                removed_docs.entry(id.clone()).or_insert(doc);
            }
            if !removal_order.contains(&id) {
                removal_order.push(id.clone());
            }
            ops.insert(id, Change::Remove);
        }
        Some(change) => {
            removed_docs.remove(&id);
            ops.insert(id, change);
        }
        None => {
            ops.remove(&id);
            removed_docs.remove(&id);
        }
    }
}

enum Incorporate {
    Unchanged,
    Added,
    Updated,
    Removed(Document),
}

/// Folds one delta document into the sorted dataset.
fn incorporate(doc: &Document, documents: &mut Vec<Document>, ordering: &[Ordering]) -> Incorporate {
    let existing = documents.iter().position(|d| d.id == doc.id);

    if let Some(k) = existing {
        if documents[k].etag == doc.etag {
            return Incorporate::Unchanged;
        }
    }

    if doc.is_tombstone() {
        return match existing {
            Some(k) => Incorporate::Removed(documents.remove(k)),
            None => Incorporate::Unchanged,
        };
    }

    match existing {
        Some(k) => {
            documents.remove(k);
            let index = find_insert_index(doc, documents, ordering);
            documents.insert(index, doc.clone());
            Incorporate::Updated
        }
        None => {
            let index = find_insert_index(doc, documents, ordering);
            documents.insert(index, doc.clone());
            Incorporate::Added
        }
    }
}

/// Binary search for the insertion index of `doc` under the active ordering.
///
/// Sort keys are compared lexicographically per ordering descriptor; full
/// ties fall back to `sort_value` under the first ordering's direction
/// (ascending when no ordering is set). A document whose sort value also
/// ties lands at the probe midpoint; where exactly within the run of equal
/// documents is implementation-defined.
pub(crate) fn find_insert_index(
    doc: &Document,
    documents: &[Document],
    ordering: &[Ordering],
) -> usize {
    let mut lo = 0;
    let mut hi = documents.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match compare_docs(doc, &documents[mid], ordering) {
            CmpOrdering::Less => hi = mid,
            CmpOrdering::Greater => lo = mid + 1,
            CmpOrdering::Equal => return mid,
        }
    }
    lo
}

fn compare_docs(a: &Document, b: &Document, ordering: &[Ordering]) -> CmpOrdering {
    for (i, descriptor) in ordering.iter().enumerate() {
        let ka = a.sort_keys.get(i);
        let kb = b.sort_keys.get(i);
        let cmp = ka.cmp(&kb);
        if cmp != CmpOrdering::Equal {
            return apply_direction(cmp, descriptor.direction);
        }
    }
    let direction = ordering
        .first()
        .map(|o| o.direction)
        .unwrap_or(Direction::Asc);
    apply_direction(a.sort_value.cmp(&b.sort_value), direction)
}

fn apply_direction(cmp: CmpOrdering, direction: Direction) -> CmpOrdering {
    match direction {
        Direction::Asc => cmp,
        Direction::Desc => cmp.reverse(),
    }
}
