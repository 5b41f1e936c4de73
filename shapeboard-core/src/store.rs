//! Shared Document Store: the replicated ordered sequence of shapes.
//!
//! Backed by a Yrs `Doc` with a single `ArrayRef`. Each element is a shape
//! serialized to a JSON string, so elements behave as immutable values and
//! a field update has to be written as delete + insert.
//!
//! ```text
//!  local op ──► transact_mut() ──► ArrayRef "shapes" ──► update_v1 observers
//!                                        ▲                 │        │
//!  remote bytes ──► apply_update() ──────┘                 │        └─► observe()  (view)
//!                   (origin = remote)                      └─► observe_local_updates() (transport,
//!                                                                 remote-origin txns skipped)
//! ```
//!
//! Yrs assigns every inserted element a unique `(client, clock)` id, which
//! gives commutative and idempotent merges: any two stores that have seen
//! the same updates report the same `to_array()`.

use yrs::encoding::read::{Cursor, Read};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, Origin, Out, ReadTxn, StateVector, Subscription, Transact,
    Update,
};

use crate::shape::Shape;

/// Root-level name of the shared array inside the Yrs document.
pub const SHAPES_ARRAY: &str = "shapes";

/// Origin tag for transactions that merge bytes received from elsewhere.
const REMOTE_ORIGIN: &str = "shapeboard/remote";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to encode shape: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Malformed update: {0}")]
    Decode(String),

    #[error("Failed to merge update: {0}")]
    Merge(String),

    #[error("Failed to register observer: {0}")]
    Observe(String),
}

/// One replica of the shape sequence.
///
/// Cloning is cheap and yields a handle to the same replica.
#[derive(Clone)]
pub struct ShapeStore {
    doc: Doc,
    shapes: ArrayRef,
}

impl ShapeStore {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Wrap an existing Yrs document.
    pub fn from_doc(doc: Doc) -> Self {
        let shapes = doc.get_or_insert_array(SHAPES_ARRAY);
        Self { doc, shapes }
    }

    /// Insert `items` at `index`. Indices past the end append.
    pub fn insert(&self, index: u32, items: &[Shape]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let encoded = items
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        let mut txn = self.doc.transact_mut();
        let at = index.min(self.shapes.len(&txn));
        self.shapes.insert_range(&mut txn, at, encoded);
        Ok(())
    }

    /// Append `items` at the end of the sequence.
    pub fn push(&self, items: &[Shape]) -> Result<(), StoreError> {
        self.insert(u32::MAX, items)
    }

    /// Remove `count` elements starting at `index`.
    ///
    /// Returns `false` without touching the sequence when the range is not
    /// fully inside it; a concurrent remote delete may have shifted indices.
    pub fn delete(&self, index: u32, count: u32) -> bool {
        if count == 0 {
            return false;
        }
        let mut txn = self.doc.transact_mut();
        let len = self.shapes.len(&txn);
        match index.checked_add(count) {
            Some(end) if end <= len => {
                self.shapes.remove_range(&mut txn, index, count);
                true
            }
            _ => false,
        }
    }

    /// Replace the element at `index` with `item` (delete + insert in one
    /// local transaction). Returns `Ok(false)` if `index` is out of range.
    pub fn replace(&self, index: u32, item: &Shape) -> Result<bool, StoreError> {
        self.replace_many(&[index], item)
    }

    /// Remove every element at `indices` and insert `item` where the first
    /// one was. `indices` must be ascending.
    pub fn replace_many(&self, indices: &[u32], item: &Shape) -> Result<bool, StoreError> {
        let Some(&first) = indices.first() else {
            return Ok(false);
        };
        let encoded = serde_json::to_string(item)?;

        let mut txn = self.doc.transact_mut();
        let len = self.shapes.len(&txn);
        if indices.iter().any(|&i| i >= len) {
            return Ok(false);
        }
        for &index in indices.iter().rev() {
            self.shapes.remove_range(&mut txn, index, 1);
        }
        self.shapes.insert(&mut txn, first, encoded);
        Ok(true)
    }

    /// Rewrite the shape with `id` inside one local transaction.
    ///
    /// `f` gets the first copy in sequence order. Every copy of `id` is
    /// removed and the result is inserted where the first one was. Returns
    /// `Ok(false)` if `id` is absent or `f` returns `None`.
    pub fn update_by_id<F>(&self, id: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&Shape) -> Option<Shape>,
    {
        let mut txn = self.doc.transact_mut();
        let entries = read_shapes(&self.shapes, &txn);
        let indices: Vec<u32> = entries
            .iter()
            .filter(|(_, shape)| shape.id == id)
            .map(|(index, _)| *index)
            .collect();
        let Some(&first) = indices.first() else {
            return Ok(false);
        };
        let Some(updated) = entries
            .iter()
            .find(|(index, _)| *index == first)
            .and_then(|(_, current)| f(current))
        else {
            return Ok(false);
        };
        let encoded = serde_json::to_string(&updated)?;

        for &index in indices.iter().rev() {
            self.shapes.remove_range(&mut txn, index, 1);
        }
        self.shapes.insert(&mut txn, first, encoded);
        Ok(true)
    }

    /// Snapshot of the resolved sequence.
    pub fn to_array(&self) -> Vec<Shape> {
        self.entries().into_iter().map(|(_, shape)| shape).collect()
    }

    /// Snapshot of the resolved sequence paired with each element's index.
    ///
    /// Elements that fail to decode are skipped, so indices may have gaps.
    pub fn entries(&self) -> Vec<(u32, Shape)> {
        let txn = self.doc.transact();
        read_shapes(&self.shapes, &txn)
    }

    /// Number of elements, including any that fail to decode.
    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.shapes.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `f` to run after every change, local or merged.
    ///
    /// `f` receives the full sequence as of the end of the transaction. It
    /// runs while the transaction is still open and must not call back into
    /// this store.
    pub fn observe<F>(&self, f: F) -> Result<Subscription, StoreError>
    where
        F: Fn(Vec<Shape>) + Send + Sync + 'static,
    {
        let shapes = self.shapes.clone();
        self.doc
            .observe_update_v1(move |txn, _event| {
                let current = read_shapes(&shapes, txn)
                    .into_iter()
                    .map(|(_, shape)| shape)
                    .collect();
                f(current);
            })
            .map_err(|e| StoreError::Observe(format!("{e:?}")))
    }

    /// Register `f` to receive the encoded update of every local change.
    ///
    /// Changes merged through [`ShapeStore::apply_update`] are not reported.
    pub fn observe_local_updates<F>(&self, f: F) -> Result<Subscription, StoreError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let remote = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() != Some(&remote) {
                    f(&event.update);
                }
            })
            .map_err(|e| StoreError::Observe(format!("{e:?}")))
    }

    /// Encoded state vector: the causal summary sent in the first step of
    /// the handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `remote_state_vector`
    /// is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, StoreError> {
        check_entry_count(remote_state_vector)?;
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// The whole replica as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge an update produced by another replica.
    ///
    /// Malformed bytes are rejected before anything is applied. Re-applying
    /// an update that was already merged has no effect.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), StoreError> {
        check_entry_count(update)?;
        let update = Update::decode_v1(update).map_err(|e| StoreError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| StoreError::Merge(e.to_string()))
    }
}

impl Default for ShapeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShapeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeStore")
            .field("len", &self.len())
            .finish()
    }
}

fn read_shapes<T: ReadTxn>(array: &ArrayRef, txn: &T) -> Vec<(u32, Shape)> {
    array
        .iter(txn)
        .enumerate()
        .filter_map(|(index, value)| {
            let index = index as u32;
            match value {
                Out::Any(Any::String(json)) => match serde_json::from_str::<Shape>(&json) {
                    Ok(shape) => Some((index, shape.normalized())),
                    Err(e) => {
                        log::warn!("Skipping malformed shape at index {index}: {e}");
                        None
                    }
                },
                _ => {
                    log::warn!("Skipping non-shape element at index {index}");
                    None
                }
            }
        })
        .collect()
}

/// Both v1 encodings open with a per-client entry count that yrs allocates
/// for up front. Every entry takes at least two bytes.
fn check_entry_count(bytes: &[u8]) -> Result<(), StoreError> {
    let mut cursor = Cursor::new(bytes);
    let count: u64 = cursor
        .read_var()
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    if count > bytes.len() as u64 / 2 {
        return Err(StoreError::Decode(format!(
            "{count} client entries claimed in {} bytes",
            bytes.len()
        )));
    }
    Ok(())
}
