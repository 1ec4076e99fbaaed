//! Heap object model and allocator (C2 + C3).
//!
//! The heap is a generational arena: [`Heap::alloc`] hands back a
//! [`crate::value::HeapRef`] (index + generation) instead of a raw pointer,
//! so a stale reference is detectable rather than aliasing freed storage —
//! the safe-Rust substitute for the original's `HeapObject*` discussed in
//! `DESIGN.md`. Every live slot carries the common header (`type_id`, `rc`)
//! from the spec's §3 Heap objects section; freeing a slot poisons its
//! header with [`TypeId::FREED`] and bumps the generation so any surviving
//! `HeapRef` into it is recognizably stale.

use std::collections::HashMap;

use crate::value::{HeapRef, Value};

/// Runtime type id. Built-in kinds get fixed low ids (mirroring `CsType` in
/// `cyber.h`); host- or script-defined types are assigned ids starting at
/// [`TypeId::FIRST_DYNAMIC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TypeId(pub u32);

impl TypeId {
    /// Sentinel written into a freed slot's header so use-after-free is
    /// detectable in debug assertions, matching `CS_NULLID`.
    pub const FREED: TypeId = TypeId(u32::MAX);

    pub const NONE: TypeId = TypeId(0);
    pub const BOOLEAN: TypeId = TypeId(1);
    pub const ERROR: TypeId = TypeId(2);
    pub const STATIC_ASTRING: TypeId = TypeId(3);
    pub const STATIC_USTRING: TypeId = TypeId(4);
    pub const SYMBOL: TypeId = TypeId(5);
    pub const TAG_LITERAL: TypeId = TypeId(6);
    pub const INTEGER: TypeId = TypeId(7);
    pub const FLOAT: TypeId = TypeId(8);
    pub const LIST: TypeId = TypeId(9);
    pub const LIST_ITER: TypeId = TypeId(10);
    pub const MAP: TypeId = TypeId(11);
    pub const MAP_ITER: TypeId = TypeId(12);
    pub const CLOSURE: TypeId = TypeId(13);
    pub const LAMBDA: TypeId = TypeId(14);
    pub const ASTRING: TypeId = TypeId(15);
    pub const USTRING: TypeId = TypeId(16);
    pub const STRING_SLICE: TypeId = TypeId(17);
    pub const RAWSTRING: TypeId = TypeId(18);
    pub const RAWSTRING_SLICE: TypeId = TypeId(19);
    pub const FIBER: TypeId = TypeId(20);
    pub const BOX: TypeId = TypeId(21);
    pub const NATIVE_FUNC: TypeId = TypeId(22);
    pub const POINTER: TypeId = TypeId(23);
    pub const FILE: TypeId = TypeId(24);
    pub const DIR: TypeId = TypeId(25);
    pub const DIR_ITER: TypeId = TypeId(26);
    pub const META_TYPE: TypeId = TypeId(27);

    /// First id available for host- or script-registered (`Instance`) types.
    pub const FIRST_DYNAMIC: TypeId = TypeId(1000);
}

/// Common header shared by every heap object, per §3 "Heap objects".
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub type_id: TypeId,
    pub rc: u32,
}

/// A native function bound by the host, identified by an opaque id the
/// embedding surface hands back through `funcLoader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFuncId(pub u32);

/// Target of a closure/lambda template: either a bytecode entry point or a
/// bound native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Bytecode(u32),
    Native(NativeFuncId),
}

/// The variant-specific payload of a heap object. Every variant named in
/// §3's Heap objects table is represented; `Instance` stands in for
/// host/script-defined object layouts, which are out of scope to specify in
/// detail.
#[derive(Debug)]
pub enum HeapObject {
    List(Vec<Value>),
    ListIter { list: HeapRef, next: usize },
    Map(IndexMap),
    MapIter { map: HeapRef, next: usize },
    Closure { target: CallTarget, arity: u8, boxes: Vec<Value> },
    Lambda { target: CallTarget, arity: u8 },
    Astring(String),
    Ustring(String),
    StringSlice { parent: HeapRef, start: usize, end: usize },
    Rawstring(Vec<u8>),
    RawstringSlice { parent: HeapRef, start: usize, end: usize },
    Fiber(Box<crate::fiber::FiberState>),
    Box(Value),
    NativeFunc { id: NativeFuncId, arity: u8 },
    Pointer(usize),
    Instance { type_id: TypeId, fields: Vec<Value> },
}

/// A minimal insertion-ordered map keyed by [`Value`] bit patterns, used for
/// the `Map`/`MapEmpty` opcodes. Keyed on bit-pattern equality per §4.1;
/// this does not attempt type-specific (e.g. string-contents) key equality,
/// matching the spec's note that such equality is layered on separately.
#[derive(Debug, Default)]
pub struct IndexMap {
    entries: Vec<(Value, Value)>,
    index: HashMap<u64, usize>,
}

impl IndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: Value) -> Option<Value> {
        self.index.get(&key.0).map(|&i| self.entries[i].1)
    }

    /// Insert or overwrite `key`. Returns the previous value, if any.
    pub fn insert(&mut self, key: Value, val: Value) -> Option<Value> {
        if let Some(&i) = self.index.get(&key.0) {
            Some(std::mem::replace(&mut self.entries[i].1, val))
        } else {
            self.index.insert(key.0, self.entries.len());
            self.entries.push((key, val));
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().copied()
    }
}

enum Slot {
    Free { next_free: Option<u32> },
    Occupied { header: Header, data: HeapObject },
}

/// The reference-counted object heap (C2 + C3): a generational arena plus
/// the retain/release/alloc operations of the spec's memory manager.
pub struct Heap {
    slots: Vec<Slot>,
    generations: Vec<u16>,
    free_head: Option<u32>,
    live_count: usize,
    /// Sum of every live object's `rc`; drives [`crate::error::ResultCode`]-adjacent
    /// diagnostics and the P2 testable property (global RC reaches zero after
    /// a leak-free `eval` + `performGC` + `deinit`).
    global_rc: i64,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self { slots: Vec::new(), generations: Vec::new(), free_head: None, live_count: 0, global_rc: 0 }
    }

    /// Current global reference count across every live object. See
    /// [`Heap::global_rc`] doc and P2 in the spec.
    pub fn global_rc(&self) -> i64 {
        self.global_rc
    }

    /// Number of live (non-freed) heap objects.
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Allocate a fresh object with `rc = 1`, returning a [`HeapRef`] to it.
    pub fn alloc(&mut self, type_id: TypeId, data: HeapObject) -> HeapRef {
        let header = Header { type_id, rc: 1 };
        self.live_count += 1;
        self.global_rc += 1;
        if let Some(index) = self.free_head {
            let idx = index as usize;
            let next_free = match &self.slots[idx] {
                Slot::Free { next_free } => *next_free,
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            self.free_head = next_free;
            self.slots[idx] = Slot::Occupied { header, data };
            HeapRef { index, generation: self.generations[idx] }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied { header, data });
            self.generations.push(0);
            HeapRef { index, generation: 0 }
        }
    }

    fn slot(&self, r: HeapRef) -> &Slot {
        assert_eq!(self.generations[r.index as usize], r.generation, "stale heap reference {r:?}");
        &self.slots[r.index as usize]
    }

    fn slot_mut(&mut self, r: HeapRef) -> &mut Slot {
        assert_eq!(self.generations[r.index as usize], r.generation, "stale heap reference {r:?}");
        &mut self.slots[r.index as usize]
    }

    /// Read-only access to `r`'s header.
    pub fn header(&self, r: HeapRef) -> Header {
        match self.slot(r) {
            Slot::Occupied { header, .. } => *header,
            Slot::Free { .. } => panic!("heap reference {r:?} points at a freed slot"),
        }
    }

    /// Read-only access to `r`'s payload.
    pub fn get(&self, r: HeapRef) -> &HeapObject {
        match self.slot(r) {
            Slot::Occupied { data, .. } => data,
            Slot::Free { .. } => panic!("heap reference {r:?} points at a freed slot"),
        }
    }

    /// Mutable access to `r`'s payload.
    pub fn get_mut(&mut self, r: HeapRef) -> &mut HeapObject {
        match self.slot_mut(r) {
            Slot::Occupied { data, .. } => data,
            Slot::Free { .. } => panic!("heap reference {r:?} points at a freed slot"),
        }
    }

    /// `retain(v)`: if `v` is a pointer, increment its refcount.
    pub fn retain(&mut self, v: Value) {
        if v.is_pointer() {
            let r = v.as_pointer();
            match self.slot_mut(r) {
                Slot::Occupied { header, .. } => header.rc += 1,
                Slot::Free { .. } => panic!("retain of freed heap reference {r:?}"),
            }
            self.global_rc += 1;
        }
    }

    /// `release(v)`: if `v` is a pointer, decrement its refcount; at zero,
    /// run the destructor (releasing children depth-first via an explicit
    /// work list, per §4.2's recursion-avoidance requirement) and free the
    /// slot.
    pub fn release(&mut self, v: Value) {
        if !v.is_pointer() {
            return;
        }
        let mut worklist = vec![v.as_pointer()];
        while let Some(r) = worklist.pop() {
            let rc = match self.slot_mut(r) {
                Slot::Occupied { header, .. } => {
                    header.rc -= 1;
                    header.rc
                }
                Slot::Free { .. } => panic!("release of freed heap reference {r:?}"),
            };
            self.global_rc -= 1;
            if rc == 0 {
                let children = self.children(r);
                self.free_slot(r);
                for child in children {
                    if child.is_pointer() {
                        // Defer the child's own rc decrement to the worklist
                        // instead of recursing, bounding stack depth on long
                        // linked structures (§4.2).
                        worklist.push(child.as_pointer());
                    }
                }
            }
        }
    }

    /// Trace `r`'s outgoing heap references (its "children"), used by both
    /// destruction (here) and the cycle collector ([`crate::gc`]).
    pub fn children(&self, r: HeapRef) -> Vec<Value> {
        match self.get(r) {
            HeapObject::List(items) => items.clone(),
            HeapObject::ListIter { list, .. } => vec![Value::pointer(*list)],
            HeapObject::Map(map) => map.iter().flat_map(|(k, v)| [k, v]).collect(),
            HeapObject::MapIter { map, .. } => vec![Value::pointer(*map)],
            HeapObject::Closure { boxes, .. } => boxes.clone(),
            HeapObject::Lambda { .. } => Vec::new(),
            HeapObject::Astring(_)
            | HeapObject::Ustring(_)
            | HeapObject::Rawstring(_)
            | HeapObject::NativeFunc { .. }
            | HeapObject::Pointer(_) => Vec::new(),
            HeapObject::StringSlice { parent, .. } | HeapObject::RawstringSlice { parent, .. } => {
                vec![Value::pointer(*parent)]
            }
            HeapObject::Fiber(state) => state.stack.iter().copied().collect(),
            HeapObject::Box(v) => vec![*v],
            HeapObject::Instance { fields, .. } => fields.clone(),
        }
    }

    /// Deallocate a slot without touching rc bookkeeping (the caller is
    /// responsible for having already accounted for the freed object and
    /// its children). Poisons the header and bumps the generation so any
    /// surviving reference is detectably stale.
    fn free_slot(&mut self, r: HeapRef) {
        let idx = r.index as usize;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.slots[idx] = Slot::Free { next_free: self.free_head };
        self.free_head = Some(r.index);
        self.live_count -= 1;
    }

    /// Iterate over every currently-live object's [`HeapRef`]. Used by the
    /// cycle collector to walk the whole heap.
    pub fn live_refs(&self) -> impl Iterator<Item = HeapRef> + '_ {
        self.slots.iter().enumerate().filter_map(move |(idx, slot)| match slot {
            Slot::Occupied { .. } => Some(HeapRef { index: idx as u32, generation: self.generations[idx] }),
            Slot::Free { .. } => None,
        })
    }

    /// Free `r` directly, bypassing the normal rc cascade. Used by the
    /// cycle collector once it has identified a set of objects reachable
    /// only from each other.
    pub(crate) fn force_free(&mut self, r: HeapRef) {
        self.global_rc -= self.header(r).rc as i64;
        self.free_slot(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn alloc_retain_release_balances_global_rc() {
        let mut heap = Heap::new();
        let r = heap.alloc(TypeId::LIST, HeapObject::List(vec![]));
        assert_eq!(heap.global_rc(), 1);
        let v = Value::pointer(r);
        heap.retain(v);
        assert_eq!(heap.header(r).rc, 2);
        heap.release(v);
        assert_eq!(heap.header(r).rc, 1);
        heap.release(v);
        assert_eq!(heap.global_rc(), 0);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn release_cascades_to_children() {
        let mut heap = Heap::new();
        let inner = heap.alloc(TypeId::LIST, HeapObject::List(vec![]));
        let outer = heap.alloc(TypeId::LIST, HeapObject::List(vec![Value::pointer(inner)]));
        heap.release(Value::pointer(outer));
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.global_rc(), 0);
    }

    #[test]
    fn freed_slot_is_reused_with_bumped_generation() {
        let mut heap = Heap::new();
        let r1 = heap.alloc(TypeId::BOX, HeapObject::Box(Value::NONE));
        heap.release(Value::pointer(r1));
        let r2 = heap.alloc(TypeId::BOX, HeapObject::Box(Value::NONE));
        assert_eq!(r1.index, r2.index);
        assert_ne!(r1.generation, r2.generation);
    }

    /// P5: for any object reachable only through its own slot, `n` retains
    /// balanced by `n` releases must leave `rc` exactly where it started —
    /// the refcount never drifts, over- or under-counts regardless of how
    /// many times it's bounced up and down.
    #[quickcheck]
    fn retain_then_release_n_times_returns_to_baseline(n: u8) -> bool {
        let mut heap = Heap::new();
        let r = heap.alloc(TypeId::BOX, HeapObject::Box(Value::NONE));
        let v = Value::pointer(r);
        for _ in 0..n {
            heap.retain(v);
        }
        for _ in 0..n {
            heap.release(v);
        }
        heap.header(r).rc == 1 && heap.global_rc() == 1 && heap.live_count() == 1
    }
}
