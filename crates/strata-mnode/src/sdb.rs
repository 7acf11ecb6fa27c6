//! Object store integration.
//!
//! The replicated object store owns every record. A table type plugs into
//! it through [`TableActions`]; the store calls those hooks on insert,
//! update, delete, encode, decode and destroy. Records are handed out as
//! [`RowRef`]s: cloning one is an `incRef`, dropping it a `decRef`.
//!
//! Lock order is store map, then row, then database index. Callers must
//! not hold a row lock while calling into the store.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::error::{Result, VGroupError};

/// Shared handle to the canonical instance of a record.
pub type RowRef<R> = Arc<Mutex<R>>;

/// Locks a record, recovering from poisoning.
pub fn lock_row<R>(row: &RowRef<R>) -> MutexGuard<'_, R> {
    row.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle hooks a table type registers with the object store.
pub trait TableActions: Send + Sync {
    type Key: Copy + Ord + Debug + Send + Sync;
    type Row: Send;

    /// Table name used in logs and errors.
    const NAME: &'static str;

    /// Key of `row`, or `None` if the store has not assigned one yet.
    fn key(&self, row: &Self::Row) -> Option<Self::Key>;

    fn assign_key(&self, row: &mut Self::Row, key: Self::Key);

    /// Key to hand out after `last`, or `None` once keys are exhausted.
    fn next_key(&self, last: Option<Self::Key>) -> Option<Self::Key>;

    /// Builds runtime state. On error the row must be left as it came in.
    fn on_insert(&self, row: &mut Self::Row) -> Result<()>;

    /// Tears down runtime state built by `on_insert`.
    fn on_delete(&self, row: &mut Self::Row);

    /// Applies an update to the canonical instance. `replacement` is `None`
    /// when the canonical instance itself was modified.
    fn on_update(&self, row: &mut Self::Row, replacement: Option<Self::Row>) -> Result<()>;

    fn encode(&self, row: &Self::Row) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8]) -> Result<Self::Row>;

    /// Frees a row no one references any more.
    fn destroy(&self, row: Self::Row);
}

/// Keyed record storage with reference-counted access.
pub trait ObjectStore<A: TableActions>: Send + Sync {
    /// Assigns a key if needed, runs the insert hook and registers the row.
    fn insert(&self, row: A::Row) -> Result<RowRef<A::Row>>;

    /// Runs the update hook on the canonical instance for `key`.
    fn update(&self, key: A::Key, replacement: Option<A::Row>) -> Result<()>;

    /// Unregisters the row and runs its delete hook.
    fn delete(&self, key: A::Key) -> Result<()>;

    fn get(&self, key: A::Key) -> Option<RowRef<A::Row>>;

    /// First row with a key greater than `cursor` (or the first row).
    fn fetch_next(&self, cursor: Option<A::Key>) -> Option<(A::Key, RowRef<A::Row>)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Inner<A: TableActions> {
    rows: BTreeMap<A::Key, RowRef<A::Row>>,
    persisted: BTreeMap<A::Key, Bytes>,
    last_key: Option<A::Key>,
}

/// In-memory object store that keeps the encoded form of every live row.
pub struct MemStore<A: TableActions> {
    actions: A,
    inner: Mutex<Inner<A>>,
}

impl<A: TableActions> MemStore<A> {
    pub fn new(actions: A) -> Self {
        Self {
            actions,
            inner: Mutex::new(Inner {
                rows: BTreeMap::new(),
                persisted: BTreeMap::new(),
                last_key: None,
            }),
        }
    }

    pub fn actions(&self) -> &A {
        &self.actions
    }

    /// Encoded form of a live row.
    pub fn persisted(&self, key: A::Key) -> Option<Bytes> {
        self.inner().persisted.get(&key).cloned()
    }

    /// Destroys every live row and rebuilds it from its encoded form, the
    /// way rows come back after a restart. Returns the number of rows
    /// rebuilt.
    ///
    /// Either every row is rebuilt or the live rows are put back as they
    /// were and the first error is returned.
    pub fn reload(&self) -> Result<usize> {
        let mut inner = self.inner();

        let mut decoded = Vec::with_capacity(inner.persisted.len());
        for (key, bytes) in &inner.persisted {
            decoded.push((*key, self.actions.decode(bytes)?));
        }

        let live = std::mem::take(&mut inner.rows);
        for row in live.values() {
            self.actions.on_delete(&mut lock_row(row));
        }

        let mut rebuilt = BTreeMap::new();
        for (key, mut row) in decoded {
            if let Err(err) = self.actions.on_insert(&mut row) {
                tracing::warn!(table = A::NAME, key = ?key, error = %err, "reload failed, keeping live rows");
                for (_, row) in rebuilt {
                    self.actions.on_delete(&mut lock_row(&row));
                    self.destroy_if_unique(row);
                }
                for (key, row) in &live {
                    if let Err(err) = self.actions.on_insert(&mut lock_row(row)) {
                        tracing::error!(table = A::NAME, key = ?key, error = %err, "failed to restore live row");
                    }
                }
                inner.rows = live;
                return Err(err);
            }
            rebuilt.insert(key, Arc::new(Mutex::new(row)));
        }

        for (_, row) in live {
            self.destroy_if_unique(row);
        }
        let count = rebuilt.len();
        inner.rows = rebuilt;
        tracing::info!(table = A::NAME, rows = count, "reloaded rows from persisted state");
        Ok(count)
    }

    fn destroy_if_unique(&self, row: RowRef<A::Row>) {
        if let Ok(row) = Arc::try_unwrap(row) {
            self.actions
                .destroy(row.into_inner().unwrap_or_else(PoisonError::into_inner));
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner<A>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(key: A::Key) -> VGroupError {
        VGroupError::Storage(format!("{} row {key:?} not found", A::NAME))
    }
}

impl<A: TableActions> ObjectStore<A> for MemStore<A> {
    fn insert(&self, mut row: A::Row) -> Result<RowRef<A::Row>> {
        let mut inner = self.inner();

        let key = match self.actions.key(&row) {
            Some(key) => key,
            None => {
                let key = self.actions.next_key(inner.last_key).ok_or_else(|| {
                    VGroupError::Storage(format!("{} key space exhausted", A::NAME))
                })?;
                self.actions.assign_key(&mut row, key);
                key
            }
        };
        if inner.rows.contains_key(&key) {
            return Err(VGroupError::Storage(format!(
                "{} row {key:?} already exists",
                A::NAME
            )));
        }

        self.actions.on_insert(&mut row)?;
        let bytes = match self.actions.encode(&row) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.actions.on_delete(&mut row);
                self.actions.destroy(row);
                return Err(err);
            }
        };

        inner.last_key = inner.last_key.max(Some(key));
        let row = Arc::new(Mutex::new(row));
        inner.rows.insert(key, Arc::clone(&row));
        inner.persisted.insert(key, bytes);
        tracing::trace!(table = A::NAME, key = ?key, "row inserted");
        Ok(row)
    }

    fn update(&self, key: A::Key, replacement: Option<A::Row>) -> Result<()> {
        let mut inner = self.inner();
        let row = inner.rows.get(&key).cloned().ok_or_else(|| Self::not_found(key))?;

        let bytes = {
            let mut row = lock_row(&row);
            self.actions.on_update(&mut row, replacement)?;
            self.actions.encode(&row)?
        };
        inner.persisted.insert(key, bytes);
        tracing::trace!(table = A::NAME, key = ?key, "row updated");
        Ok(())
    }

    fn delete(&self, key: A::Key) -> Result<()> {
        let row = {
            let mut inner = self.inner();
            inner.persisted.remove(&key);
            inner.rows.remove(&key).ok_or_else(|| Self::not_found(key))?
        };

        self.actions.on_delete(&mut lock_row(&row));
        self.destroy_if_unique(row);
        tracing::trace!(table = A::NAME, key = ?key, "row deleted");
        Ok(())
    }

    fn get(&self, key: A::Key) -> Option<RowRef<A::Row>> {
        self.inner().rows.get(&key).cloned()
    }

    fn fetch_next(&self, cursor: Option<A::Key>) -> Option<(A::Key, RowRef<A::Row>)> {
        let inner = self.inner();
        let lower = cursor.map_or(Bound::Unbounded, Bound::Excluded);
        inner
            .rows
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(key, row)| (*key, Arc::clone(row)))
    }

    fn len(&self) -> usize {
        self.inner().rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Note {
        id: u32,
        text: String,
        live: bool,
    }

    #[derive(Default)]
    struct NoteActions {
        attempts: AtomicUsize,
        fail_attempt: AtomicUsize,
        inserts: AtomicUsize,
        deletes: AtomicUsize,
        destroys: AtomicUsize,
    }

    impl TableActions for NoteActions {
        type Key = u32;
        type Row = Note;
        const NAME: &'static str = "notes";

        fn key(&self, row: &Note) -> Option<u32> {
            (row.id != 0).then_some(row.id)
        }

        fn assign_key(&self, row: &mut Note, key: u32) {
            row.id = key;
        }

        fn next_key(&self, last: Option<u32>) -> Option<u32> {
            last.map_or(Some(1), |k| k.checked_add(1))
        }

        fn on_insert(&self, row: &mut Note) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if row.text.is_empty() || attempt == self.fail_attempt.load(Ordering::SeqCst) {
                return Err(VGroupError::InvalidDatabase(String::new()));
            }
            row.live = true;
            self.inserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_delete(&self, row: &mut Note) {
            row.live = false;
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_update(&self, row: &mut Note, replacement: Option<Note>) -> Result<()> {
            if let Some(new) = replacement {
                row.text = new.text;
            }
            Ok(())
        }

        fn encode(&self, row: &Note) -> Result<Bytes> {
            Ok(Bytes::from(format!("{}:{}", row.id, row.text)))
        }

        fn decode(&self, bytes: &[u8]) -> Result<Note> {
            let text = std::str::from_utf8(bytes).map_err(|e| VGroupError::Codec(e.to_string()))?;
            let (id, text) = text
                .split_once(':')
                .ok_or_else(|| VGroupError::Codec(text.to_string()))?;
            Ok(Note {
                id: id.parse().map_err(|_| VGroupError::Codec(id.to_string()))?,
                text: text.to_string(),
                live: false,
            })
        }

        fn destroy(&self, _row: Note) {
            self.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
            ..Note::default()
        }
    }

    #[test]
    fn insert_assigns_increasing_keys() {
        let store = MemStore::new(NoteActions::default());
        let a = store.insert(note("a")).unwrap();
        let b = store.insert(note("b")).unwrap();
        assert_eq!(lock_row(&a).id, 1);
        assert_eq!(lock_row(&b).id, 2);
        assert!(lock_row(&a).live);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn failed_insert_hook_registers_nothing() {
        let store = MemStore::new(NoteActions::default());
        assert!(store.insert(note("")).is_err());
        assert!(store.is_empty());
        assert!(store.persisted(1).is_none());
    }

    #[test]
    fn update_with_replacement_keeps_identity() {
        let store = MemStore::new(NoteActions::default());
        let handle = store.insert(note("old")).unwrap();
        store.update(1, Some(note("new"))).unwrap();

        assert!(Arc::ptr_eq(&handle, &store.get(1).unwrap()));
        assert_eq!(lock_row(&handle).text, "new");
        assert_eq!(store.persisted(1).unwrap(), Bytes::from("1:new"));
    }

    #[test]
    fn delete_destroys_only_the_last_reference() {
        let store = MemStore::new(NoteActions::default());
        store.insert(note("a")).unwrap();
        let held = store.insert(note("b")).unwrap();

        store.delete(1).unwrap();
        store.delete(2).unwrap();
        assert_eq!(store.actions().deletes.load(Ordering::SeqCst), 2);
        assert_eq!(store.actions().destroys.load(Ordering::SeqCst), 1);
        assert!(!lock_row(&held).live);
        assert!(matches!(store.delete(2), Err(VGroupError::Storage(_))));
    }

    #[test]
    fn fetch_next_walks_in_key_order() {
        let store = MemStore::new(NoteActions::default());
        for text in ["a", "b", "c"] {
            store.insert(note(text)).unwrap();
        }
        store.delete(2).unwrap();

        let mut cursor = None;
        let mut seen = Vec::new();
        while let Some((key, _)) = store.fetch_next(cursor) {
            seen.push(key);
            cursor = Some(key);
        }
        assert_eq!(seen, vec![1, 3]);
    }

    #[test]
    fn reload_rebuilds_from_encoded_rows() {
        let store = MemStore::new(NoteActions::default());
        store.insert(note("a")).unwrap();
        store.insert(note("b")).unwrap();

        assert_eq!(store.reload().unwrap(), 2);
        let row = store.get(2).unwrap();
        assert_eq!(*lock_row(&row), Note { id: 2, text: "b".into(), live: true });
        assert_eq!(store.actions().inserts.load(Ordering::SeqCst), 4);
        assert_eq!(store.actions().destroys.load(Ordering::SeqCst), 2);

        // Keys keep counting from where they were.
        let c = store.insert(note("c")).unwrap();
        assert_eq!(lock_row(&c).id, 3);
    }

    #[test]
    fn reload_failure_keeps_live_rows() {
        let store = MemStore::new(NoteActions::default());
        let a = store.insert(note("a")).unwrap();
        let b = store.insert(note("b")).unwrap();

        // Attempts 3 and 4 rebuild rows 1 and 2; the second one fails.
        store.actions().fail_attempt.store(4, Ordering::SeqCst);
        assert!(store.reload().is_err());

        assert_eq!(store.len(), 2);
        assert!(Arc::ptr_eq(&a, &store.get(1).unwrap()));
        assert!(Arc::ptr_eq(&b, &store.get(2).unwrap()));
        assert!(lock_row(&a).live && lock_row(&b).live);
        assert_eq!(store.persisted(2).unwrap(), Bytes::from("2:b"));
        // Only the half-built row 1 was thrown away.
        assert_eq!(store.actions().destroys.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_key_space_is_a_storage_error() {
        let store = MemStore::new(NoteActions::default());
        store
            .insert(Note {
                id: u32::MAX,
                ..note("last")
            })
            .unwrap();

        assert!(matches!(store.insert(note("next")), Err(VGroupError::Storage(_))));
        assert_eq!(store.len(), 1);
    }
}
