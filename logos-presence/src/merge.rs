//! Revision-based merge of remote value updates.
//!
//! Merging is per `(key, client)` and driven entirely by revisions; sender
//! timestamps are only corrected by the clock skew, never compared.
//!
//! Rules, applied recursively per directory item:
//!
//! | update    | base                              | result                          |
//! |-----------|-----------------------------------|---------------------------------|
//! | leaf      | absent, or revision < update      | update, timestamp + skew        |
//! | leaf      | revision >= update                | base                            |
//! | directory | absent                            | empty dir at update revision    |
//! | directory | directory                         | base dir, revision raised, items merged |
//! | directory | leaf with revision >= update      | base leaf                       |
//! | directory | leaf with revision < update       | empty dir at update revision    |
//!
//! Concurrent leaf/directory flips at one path from different clients are not
//! resolved beyond these rules. This is not a proven CRDT.
//!
//! Reference: Kleppmann, Chapter 5, "Detecting Concurrent Writes"

use crate::state::{ValueDirectory, ValueDirectoryOrState};

/// Merge `update` over `base`, shifting every accepted leaf timestamp by
/// `time_delta` ms.
pub fn merge_value_directory<T: Clone>(
    base: Option<ValueDirectoryOrState<T>>,
    update: &ValueDirectoryOrState<T>,
    time_delta: i64,
) -> ValueDirectoryOrState<T> {
    match update {
        ValueDirectoryOrState::State(state) => match base {
            Some(base) if base.revision() >= state.revision => base,
            _ => {
                let mut state = state.clone();
                state.timestamp = state.timestamp.saturating_add(time_delta);
                ValueDirectoryOrState::State(state)
            }
        },
        ValueDirectoryOrState::Directory(dir) => {
            let mut merged = match base {
                None => ValueDirectory::new(dir.revision),
                Some(ValueDirectoryOrState::Directory(mut existing)) => {
                    // An older directory update may arrive after a newer one.
                    existing.revision = existing.revision.max(dir.revision);
                    existing
                }
                Some(ValueDirectoryOrState::State(leaf)) if leaf.revision >= dir.revision => {
                    return ValueDirectoryOrState::State(leaf);
                }
                Some(ValueDirectoryOrState::State(_)) => ValueDirectory::new(dir.revision),
            };
            for (key, item) in &dir.items {
                let existing = merged.items.remove(key);
                let next = merge_value_directory(existing, item, time_delta);
                merged.items.insert(key.clone(), next);
            }
            ValueDirectoryOrState::Directory(merged)
        }
    }
}

/// Merge in place. Returns whether the stored value changed.
pub fn merge_into<T: Clone + PartialEq>(
    slot: &mut Option<ValueDirectoryOrState<T>>,
    update: &ValueDirectoryOrState<T>,
    time_delta: i64,
) -> bool {
    let before = slot.take();
    let merged = merge_value_directory(before.clone(), update, time_delta);
    let changed = before.as_ref() != Some(&merged);
    *slot = Some(merged);
    changed
}
