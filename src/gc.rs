use std::collections::HashSet;

use crate::heap::Heap;
use crate::objects::{self, Header};
use crate::value::Value;

/// Aggregated GC statistics, purely observational (never load-bearing for
/// correctness, only for `gc_debug` tracing and the adaptive threshold).
#[derive(Default, Debug, Clone)]
pub struct GcStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GcStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { log::trace!($($arg)*); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => {}; }
pub(crate) use gc_trace;

/// Mark-and-sweep collector over a [`Heap`]. The spec describes metadata as a
/// single `{isMarked}` bit per object (§4.2); this refines that into a
/// standard tri-color scheme (white = untraced, gray = queued, black = traced
/// and kept) so tracing is an explicit worklist loop rather than recursion.
/// Every object starts white each cycle; anything still white after the root
/// walk is garbage.
pub struct GarbageCollector {
    white_set: HashSet<*mut Header>,
    gray_set: HashSet<*mut Header>,
    black_set: HashSet<*mut Header>,
    stats: GcStats,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            white_set: HashSet::new(),
            gray_set: HashSet::new(),
            black_set: HashSet::new(),
            stats: GcStats::default(),
        }
    }

    pub fn prepare_collection(&mut self, heap: &Heap) {
        self.reset();
        for &ptr in heap.iter() {
            self.white_set.insert(ptr);
        }
    }

    /// Mark a single object reachable. Unknown pointers (not currently tracked
    /// by the heap) are silently ignored per §4.2 - this tolerates roots that
    /// outlive or predate registration.
    pub fn mark_object(&mut self, obj: *mut Header) {
        if obj.is_null() || self.black_set.contains(&obj) {
            return;
        }
        if self.white_set.remove(&obj) {
            self.gray_set.insert(obj);
            gc_trace!("mark enqueue {:p}", obj);
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Some(ptr) = value.as_object_ptr() {
            self.mark_object(ptr);
        }
    }

    /// Drain the gray worklist, blackening each object by tracing its owned
    /// references. Non-recursive: each traced object's references are
    /// collected into a scratch buffer first (to avoid re-entering `self`
    /// from inside the trace callback), then queued.
    pub fn trace_references(&mut self) {
        let mut scratch: Vec<Value> = Vec::new();
        while let Some(&obj) = self.gray_set.iter().next() {
            self.gray_set.remove(&obj);
            self.black_set.insert(obj);
            scratch.clear();
            unsafe {
                objects::trace_object(obj, &mut |v| scratch.push(v));
            }
            for v in scratch.drain(..) {
                self.mark_value(v);
            }
        }
    }

    pub fn sweep(&mut self, heap: &mut Heap) -> usize {
        let mut freed_bytes = 0;
        for &ptr in self.white_set.iter() {
            unsafe {
                freed_bytes += objects::deep_size_of(ptr);
            }
            heap.remove(ptr);
            unsafe {
                objects::drop_object(ptr);
            }
        }
        self.white_set.clear();
        gc_trace!("sweep freed_bytes={}", freed_bytes);
        freed_bytes
    }

    pub fn reset(&mut self) {
        self.white_set.clear();
        self.gray_set.clear();
        self.black_set.clear();
    }

    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle #{} freed={} before={} after={} next_trigger={}",
            self.stats.cycles, freed, before, after, next_trigger
        );
    }

    pub fn stats(&self) -> &GcStats {
        &self.stats
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn sweep_keeps_reachable_objects_and_frees_the_rest() {
        let mut heap = Heap::new();
        let kept_string = heap.alloc_string("kept");
        let root_array = heap.alloc_array(vec![Value::object(kept_string)]);
        let orphan = heap.alloc_string("orphan");
        assert_eq!(heap.len(), 3);

        let mut gc = GarbageCollector::new();
        gc.prepare_collection(&heap);
        gc.mark_object(root_array);
        gc.trace_references();
        let freed = gc.sweep(&mut heap);

        assert!(freed > 0);
        assert_eq!(heap.len(), 2);
        assert!(heap.iter().any(|&p| p == root_array));
        assert!(heap.iter().any(|&p| p == kept_string));
        assert!(!heap.iter().any(|&p| p == orphan));
    }

    #[test]
    fn unreachable_roots_after_a_cycle_are_unmarked_in_the_next() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("a");
        let mut gc = GarbageCollector::new();

        gc.prepare_collection(&heap);
        gc.mark_object(a);
        gc.trace_references();
        gc.sweep(&mut heap);

        // Next cycle starts white regardless of the previous cycle's marks.
        let expected = unsafe { objects::deep_size_of(a) };
        gc.prepare_collection(&heap);
        let freed = gc.sweep(&mut heap);
        assert_eq!(freed, expected);
        assert_eq!(heap.len(), 0);
    }
}
