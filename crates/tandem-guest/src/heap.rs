//! Reference-counted object arena
//!
//! Objects live in a slot vector; freed slots go on a free list and are
//! reused by later allocations. Dropping the last reference frees the object
//! and releases every reference it holds, including the one on its class.
//! Capsule destructors are not run here: they are handed back to the caller
//! so they execute after the heap lock is released.

use std::collections::BTreeMap;

use crate::object::{CapsuleDestructor, CapsulePayload, ObjectData, ObjectId};

/// A capsule destructor waiting to run.
pub(crate) type PendingFinalizer = (CapsuleDestructor, CapsulePayload);

struct HeapEntry {
    refcount: usize,
    immortal: bool,
    class: ObjectId,
    data: ObjectData,
}

/// Snapshot of heap occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Live objects, immortal ones included
    pub live_objects: usize,
    /// Recycled slots available for reuse
    pub free_slots: usize,
    /// Live objects by payload kind
    pub objects_by_kind: BTreeMap<&'static str, usize>,
}

/// The object arena.
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<ObjectId>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
        }
    }

    /// Allocate an object with refcount 1. Takes a new reference to `class`.
    pub fn allocate(&mut self, class: ObjectId, data: ObjectData) -> ObjectId {
        self.inc_ref(class);
        self.insert(HeapEntry {
            refcount: 1,
            immortal: false,
            class,
            data,
        })
    }

    /// Allocate an object that is never freed.
    ///
    /// `class` may be a placeholder that is patched later with
    /// [`Heap::set_class`] while bootstrapping the type hierarchy.
    pub fn allocate_immortal(&mut self, class: ObjectId, data: ObjectData) -> ObjectId {
        self.insert(HeapEntry {
            refcount: 1,
            immortal: true,
            class,
            data,
        })
    }

    fn insert(&mut self, entry: HeapEntry) -> ObjectId {
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = ObjectId::new(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    pub(crate) fn set_class(&mut self, id: ObjectId, class: ObjectId) {
        if let Some(entry) = self.entry_mut(id) {
            entry.class = class;
        }
    }

    fn entry(&self, id: ObjectId) -> Option<&HeapEntry> {
        self.entries.get(id.index()).and_then(Option::as_ref)
    }

    fn entry_mut(&mut self, id: ObjectId) -> Option<&mut HeapEntry> {
        self.entries.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Check whether `id` names a live object.
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.entry(id).is_some()
    }

    pub fn get(&self, id: ObjectId) -> Option<&ObjectData> {
        self.entry(id).map(|e| &e.data)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjectData> {
        self.entry_mut(id).map(|e| &mut e.data)
    }

    /// Class pointer of a live object.
    pub fn class_of(&self, id: ObjectId) -> Option<ObjectId> {
        self.entry(id).map(|e| e.class)
    }

    /// Current reference count; 0 for freed slots.
    pub fn refcount(&self, id: ObjectId) -> usize {
        self.entry(id).map_or(0, |e| e.refcount)
    }

    pub fn is_immortal(&self, id: ObjectId) -> bool {
        self.entry(id).is_some_and(|e| e.immortal)
    }

    pub fn inc_ref(&mut self, id: ObjectId) {
        match self.entry_mut(id) {
            Some(entry) if entry.immortal => {}
            Some(entry) => entry.refcount += 1,
            None => tracing::error!(object = %id, "inc_ref on freed object"),
        }
    }

    /// Drop one reference, freeing the object and its children at zero.
    ///
    /// Destructors of freed capsules are appended to `finalizers`.
    pub(crate) fn dec_ref(&mut self, id: ObjectId, finalizers: &mut Vec<PendingFinalizer>) {
        let mut worklist = vec![id];
        while let Some(id) = worklist.pop() {
            let Some(slot) = self.entries.get_mut(id.index()) else {
                tracing::error!(object = %id, "dec_ref on unknown slot");
                continue;
            };
            let Some(entry) = slot.as_mut() else {
                tracing::error!(object = %id, "dec_ref on freed object");
                continue;
            };
            if entry.immortal {
                continue;
            }
            if entry.refcount > 1 {
                entry.refcount -= 1;
                continue;
            }
            let Some(entry) = slot.take() else { continue };
            self.free_list.push(id);

            worklist.push(entry.class);
            entry.data.child_ids(&mut worklist);
            if let ObjectData::Capsule(mut capsule) = entry.data {
                if let Some(destructor) = capsule.destructor.take() {
                    finalizers.push((destructor, capsule.payload));
                }
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut objects_by_kind = BTreeMap::new();
        let mut live_objects = 0;
        for entry in self.entries.iter().flatten() {
            live_objects += 1;
            *objects_by_kind.entry(entry.data.kind_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            objects_by_kind,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
