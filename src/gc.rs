// File: src/gc.rs
//
// Mark-and-sweep garbage collector over an index arena. The teacher crate
// has no GC at all -- its closures and upvalues are `Arc<Mutex<_>>`, which
// cannot reclaim the cycles modules/closures/upvalues form (see DESIGN.md
// and spec.md §9 "Cyclic graphs"). Object references are plain arena
// indices (`ObjRef`), the representation spec.md §9 recommends when the
// host language lacks safe cyclic pointers.

use std::collections::HashMap;

use crate::value::{Obj, ObjKind, Value};

/// Index into the heap arena. Not traced itself -- it is the trace target.
pub type ObjRef = usize;

const INITIAL_GC_THRESHOLD: usize = 1 << 20; // 1 MiB, mirrors typical clox-style defaults
const DEFAULT_HEAP_GROW_RATE: f64 = 1.5;

/// One arena slot: either a live object or a free-list link.
enum Slot {
    Live(Obj),
    Free(Option<ObjRef>),
}

pub struct Heap {
    slots: Vec<Slot>,
    free_list: Option<ObjRef>,
    allocated_bytes: usize,
    next_gc: usize,
    heap_grow_rate: f64,
    /// Weak intern table: byte content -> canonical String object.
    /// Entries are removed during sweep for any string about to be freed
    /// (spec.md §4.5 "string interning vs GC").
    interned: HashMap<Box<str>, ObjRef>,
    pub stress_mode: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(INITIAL_GC_THRESHOLD, DEFAULT_HEAP_GROW_RATE)
    }

    pub fn with_config(initial_gc: usize, heap_grow_rate: f64) -> Self {
        Heap {
            slots: Vec::new(),
            free_list: None,
            allocated_bytes: 0,
            next_gc: initial_gc.max(1024),
            heap_grow_rate,
            interned: HashMap::new(),
            stress_mode: std::env::var("JSTAR_GC_STRESS").is_ok(),
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn should_collect(&self) -> bool {
        self.stress_mode || self.allocated_bytes > self.next_gc
    }

    fn size_hint(kind: &ObjKind) -> usize {
        // Rough sizing, enough to drive the growth policy; exact byte
        // accounting is not load-bearing for correctness.
        match kind {
            ObjKind::Str(s) => 32 + s.bytes.len(),
            ObjKind::List(l) => 32 + l.items.len() * 16,
            ObjKind::Tuple(t) => 32 + t.items.len() * 16,
            ObjKind::Table(t) => 48 + t.capacity() * 32,
            ObjKind::Class(_) => 96,
            ObjKind::Instance(i) => 48 + i.fields.len() * 24,
            ObjKind::Function(_) => 128,
            ObjKind::Closure(c) => 32 + c.upvalues.len() * 8,
            ObjKind::Upvalue(_) => 24,
            ObjKind::Native(_) => 64,
            ObjKind::BoundMethod(_) => 24,
            ObjKind::Module(_) => 96,
            ObjKind::StackTrace(f) => 32 + f.len() * 48,
            ObjKind::Userdata(_) => 64,
        }
    }

    /// Allocates a new object, without triggering collection. Callers that
    /// want GC pressure to matter call `should_collect`/`collect` around
    /// this (the VM does, per spec.md §4.5's allocator contract).
    pub fn alloc(&mut self, kind: ObjKind) -> ObjRef {
        self.allocated_bytes += Self::size_hint(&kind);
        let obj = Obj { mark: false, class: None, kind };
        match self.free_list {
            Some(slot) => {
                self.free_list = match &self.slots[slot] {
                    Slot::Free(next) => *next,
                    Slot::Live(_) => unreachable!("free list points at a live slot"),
                };
                self.slots[slot] = Slot::Live(obj);
                slot
            }
            None => {
                self.slots.push(Slot::Live(obj));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r] {
            Slot::Live(o) => o,
            Slot::Free(_) => panic!("dangling ObjRef {r}: object was already collected"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r] {
            Slot::Live(o) => o,
            Slot::Free(_) => panic!("dangling ObjRef {r}: object was already collected"),
        }
    }

    /// Interns a string by byte content, allocating a new `String` object
    /// only on first sight (spec.md §3.2/§3.3 invariant #3: intern
    /// uniqueness).
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(&r) = self.interned.get(s) {
            return r;
        }
        let r = self.alloc(ObjKind::new_string(s.to_string(), true));
        self.interned.insert(s.into(), r);
        r
    }

    /// Allocates a non-interned string (e.g. the result of runtime
    /// concatenation); long or non-identifier-like strings need not be
    /// interned per spec.md §4.1.
    pub fn alloc_string(&mut self, s: String) -> ObjRef {
        self.alloc(ObjKind::new_string(s, false))
    }

    /// Runs a full mark-sweep pass. `roots` yields every object directly
    /// reachable from the VM's root set (spec.md §3.3 invariant #1); this
    /// function handles transitive marking and sweeping.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjRef>) {
        let mut gray: Vec<ObjRef> = Vec::new();
        for r in roots {
            if self.mark(r) {
                gray.push(r);
            }
        }
        while let Some(r) = gray.pop() {
            let children = self.children_of(r);
            for c in children {
                if self.mark(c) {
                    gray.push(c);
                }
            }
        }
        self.sweep();

        let live_bytes = self.allocated_bytes;
        self.next_gc = ((live_bytes as f64) * self.heap_grow_rate).max(INITIAL_GC_THRESHOLD as f64) as usize;
    }

    /// Marks `r` (and its class, if any) if unmarked. Returns true if this
    /// call transitioned it from unmarked to marked (so callers should
    /// push it onto the gray worklist).
    fn mark(&mut self, r: ObjRef) -> bool {
        let class = {
            let obj = self.get_mut(r);
            if obj.mark {
                return false;
            }
            obj.mark = true;
            obj.class
        };
        if let Some(c) = class {
            self.mark(c);
        }
        true
    }

    fn children_of(&self, r: ObjRef) -> Vec<ObjRef> {
        let mut out = Vec::new();
        let push_value = |v: &Value, out: &mut Vec<ObjRef>| {
            if let Value::Object(o) = v {
                out.push(*o);
            }
        };
        match &self.get(r).kind {
            ObjKind::Str(_) => {}
            ObjKind::List(l) => l.items.iter().for_each(|v| push_value(v, &mut out)),
            ObjKind::Tuple(t) => t.items.iter().for_each(|v| push_value(v, &mut out)),
            ObjKind::Table(t) => {
                for (k, v) in t.iter() {
                    push_value(k, &mut out);
                    push_value(v, &mut out);
                }
            }
            ObjKind::Class(c) => {
                if let Some(s) = c.superclass {
                    out.push(s);
                }
                for v in c.methods.values() {
                    push_value(v, &mut out);
                }
            }
            ObjKind::Instance(i) => {
                out.push(i.class);
                for v in i.fields.values() {
                    push_value(v, &mut out);
                }
            }
            ObjKind::Function(f) => {
                out.push(f.module);
                if let Some(c) = f.home_class {
                    out.push(c);
                }
            }
            ObjKind::Closure(c) => {
                out.push(c.function);
                out.extend(c.upvalues.iter().copied());
            }
            ObjKind::Upvalue(u) => {
                if let crate::value::UpvalueState::Closed(v) = &u.state {
                    push_value(v, &mut out);
                }
            }
            ObjKind::Native(n) => {
                if let Some(m) = n.module {
                    out.push(m);
                }
            }
            ObjKind::BoundMethod(b) => {
                push_value(&b.receiver, &mut out);
                out.push(b.method);
            }
            ObjKind::Module(m) => {
                for v in m.globals.values() {
                    push_value(v, &mut out);
                }
            }
            ObjKind::StackTrace(_) => {}
            ObjKind::Userdata(_) => {}
        }
        out
    }

    fn sweep(&mut self) {
        for i in 0..self.slots.len() {
            let free_this = match &self.slots[i] {
                Slot::Live(o) => !o.mark,
                Slot::Free(_) => false,
            };
            if free_this {
                if let Slot::Live(obj) = &self.slots[i] {
                    if let ObjKind::Str(s) = &obj.kind {
                        if s.interned {
                            self.interned.remove(s.bytes.as_str());
                        }
                    }
                    self.allocated_bytes = self.allocated_bytes.saturating_sub(Self::size_hint(&obj.kind));
                }
                self.slots[i] = Slot::Free(self.free_list);
                self.free_list = Some(i);
            } else if let Slot::Live(o) = &mut self.slots[i] {
                o.mark = false;
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
