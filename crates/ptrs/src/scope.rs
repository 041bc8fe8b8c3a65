//! Lexical scope frames and symbol resolution.
//!
//! Every activation record is a *frame*: a cell segment for its variables,
//! the list of arena segments allocated while it was current, a lexical
//! `outer` link for closures, and the dynamic caller chain used for stack
//! traces. Frames live in a central store and are addressed by id, the same
//! index-over-pointer scheme the heap uses, so closures can keep a frame
//! alive past its dynamic extent.
//!
//! Variables are addressed by `(depth, slot)`: resolution walks the `outer`
//! chain `depth` times and indexes the frame's cell segment. Depth 0 is the
//! current frame.

use crate::{
    error::{ErrorKind, RunError, RunResult},
    heap::{Heap, SegId},
};

/// Hard ceiling on interpreter call depth, guarding the host stack the way
/// the arena limit guards script memory.
pub(crate) const MAX_CALL_DEPTH: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FrameId(u32);

impl FrameId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn index_u32(self) -> u32 {
        self.0
    }
}

/// A resolved variable reference: how many frames out, which slot.
///
/// The preparation pass writes these; `UNRESOLVED` is the parser's
/// placeholder and must never survive into execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Symbol {
    pub depth: u16,
    pub slot: u16,
}

impl Symbol {
    pub const UNRESOLVED: Self = Self {
        depth: u16::MAX,
        slot: u16::MAX,
    };
}

#[derive(Debug)]
struct Frame {
    cells: SegId,
    outer: Option<FrameId>,
    /// Arena segments owned by this frame, the variable segment included.
    arena: Vec<SegId>,
    /// Set when a function value capturing this frame is created; the frame
    /// and its arena then survive `leave`.
    promoted: bool,
    alive: bool,
    /// Dynamic caller link, only set on call frames.
    caller: Option<FrameId>,
    /// `(callee name, call position)` for stack traces; `pos` is a byte
    /// offset into the calling module's source.
    pub trace: Option<(String, u32)>,
}

#[derive(Debug, Default)]
pub(crate) struct Scopes {
    frames: Vec<Frame>,
    /// Ids of frames that were left without being promoted; reused so call
    /// churn does not grow the table.
    free: Vec<u32>,
}

impl Scopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a frame with `slots` variable cells charged to the arena.
    pub fn enter(
        &mut self,
        outer: Option<FrameId>,
        slots: usize,
        heap: &mut Heap,
    ) -> RunResult<FrameId> {
        let cells = heap.alloc_cells(slots, true)?;
        let frame = Frame {
            cells,
            outer,
            arena: vec![cells],
            promoted: false,
            alive: true,
            caller: None,
            trace: None,
        };
        if let Some(idx) = self.free.pop() {
            self.frames[idx as usize] = frame;
            return Ok(FrameId(idx));
        }
        let id = FrameId(u32::try_from(self.frames.len()).expect("frame overflow"));
        self.frames.push(frame);
        Ok(id)
    }

    /// Records the dynamic caller of a call frame for stack traces.
    pub fn set_caller(&mut self, id: FrameId, caller: FrameId, callee: String, pos: u32) {
        let frame = &mut self.frames[id.index()];
        frame.caller = Some(caller);
        frame.trace = Some((callee, pos));
    }

    /// Leaves a frame: unless a closure captured it, the whole arena is
    /// released as one unit. A promoted frame's arena is transferred to heap
    /// ownership instead, so captured variables (and arrays they point at)
    /// stay valid.
    pub fn leave(&mut self, id: FrameId, heap: &mut Heap) {
        let frame = &mut self.frames[id.index()];
        if frame.promoted {
            for &seg in &frame.arena {
                heap.promote(seg);
            }
            return;
        }
        frame.alive = false;
        let arena = std::mem::take(&mut frame.arena);
        for seg in arena {
            heap.release(seg);
        }
        self.free.push(id.index_u32());
    }

    /// Marks the frame as captured by a closure.
    pub fn promote(&mut self, id: FrameId) {
        self.frames[id.index()].promoted = true;
    }

    /// Registers an arena allocation with the owning frame.
    pub fn adopt(&mut self, id: FrameId, seg: SegId) {
        self.frames[id.index()].arena.push(seg);
    }

    /// Resolves a symbol to its storage cell: `(segment, slot index)`.
    pub fn resolve(&self, start: FrameId, symbol: Symbol) -> RunResult<(SegId, usize)> {
        debug_assert_ne!(symbol, Symbol::UNRESOLVED, "unprepared symbol reached execution");
        let mut frame = &self.frames[start.index()];
        for _ in 0..symbol.depth {
            let outer = frame.outer.ok_or_else(|| {
                RunError::new(ErrorKind::TypeError, "symbol resolves outside the scope chain")
            })?;
            frame = &self.frames[outer.index()];
        }
        Ok((frame.cells, symbol.slot as usize))
    }

    pub fn cells_of(&self, id: FrameId) -> SegId {
        self.frames[id.index()].cells
    }

    pub fn outer_of(&self, id: FrameId) -> Option<FrameId> {
        self.frames[id.index()].outer
    }

    /// Walks the dynamic caller chain from `id`, yielding recorded
    /// `(callee, call position, caller frame)` entries.
    pub fn trace_from(&self, id: FrameId) -> Vec<(String, u32, FrameId)> {
        let mut out = Vec::new();
        let mut cur = Some(id);
        while let Some(fid) = cur {
            let frame = &self.frames[fid.index()];
            if let (Some((callee, pos)), Some(caller)) = (&frame.trace, frame.caller) {
                out.push((callee.clone(), *pos, caller));
                cur = Some(caller);
            } else {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Var;

    #[test]
    fn resolution_walks_the_outer_chain() {
        let mut heap = Heap::new(1 << 16);
        let mut scopes = Scopes::new();
        let outer = scopes.enter(None, 2, &mut heap).unwrap();
        let inner = scopes.enter(Some(outer), 1, &mut heap).unwrap();

        let (seg, slot) = scopes
            .resolve(inner, Symbol { depth: 1, slot: 1 })
            .unwrap();
        heap.cells_mut(seg).unwrap()[slot] = Var::Int(7);

        let (seg2, slot2) = scopes
            .resolve(outer, Symbol { depth: 0, slot: 1 })
            .unwrap();
        assert_eq!((seg, slot), (seg2, slot2));
        assert!(matches!(heap.cells(seg2).unwrap()[slot2], Var::Int(7)));
    }

    #[test]
    fn leave_releases_the_arena_atomically() {
        let mut heap = Heap::new(1 << 16);
        let mut scopes = Scopes::new();
        let frame = scopes.enter(None, 4, &mut heap).unwrap();
        let extra = heap.alloc_bytes(64, true).unwrap();
        scopes.adopt(frame, extra);

        let used = heap.stack_used();
        assert!(used > 0);
        scopes.leave(frame, &mut heap);
        assert_eq!(heap.stack_used(), 0);
        assert!(!heap.is_alive(extra));
        assert!(heap.cells(scopes.cells_of(frame)).is_err());
        let _ = used;
    }

    #[test]
    fn promoted_frames_survive_leave() {
        let mut heap = Heap::new(1 << 16);
        let mut scopes = Scopes::new();
        let frame = scopes.enter(None, 1, &mut heap).unwrap();
        scopes.promote(frame);
        scopes.leave(frame, &mut heap);
        assert_eq!(heap.stack_used(), 0, "promotion transfers the stack charge");
        assert!(heap.cells(scopes.cells_of(frame)).is_ok());
    }
}
