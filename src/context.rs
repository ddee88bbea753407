/// Task contexts: the per-logical-thread record of team membership and
/// region nesting. Contexts form a stack per thread through `parent` links.
/// Records live in a block-wide arena and link to each other by index, so a
/// convergent team can hang its contexts off another lane's stack.

/// How deep the owning context is nested in parallel regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParallelDepth {
    /// Not inside any parallel region.
    #[default]
    Sequential,
    /// Directly inside a level-1 parallel region.
    Level1,
    /// Inside two or more nested parallel regions.
    Nested,
}

impl ParallelDepth {
    /// Value reported by the parallel-level query.
    pub fn level(self) -> u8 {
        match self {
            ParallelDepth::Sequential => 0,
            ParallelDepth::Level1 => 1,
            ParallelDepth::Nested => 2,
        }
    }

    pub fn deeper(self) -> Self {
        match self {
            ParallelDepth::Sequential => ParallelDepth::Level1,
            _ => ParallelDepth::Nested,
        }
    }

    pub fn in_parallel(self) -> bool {
        self != ParallelDepth::Sequential
    }

    pub fn from_level(level: u32) -> Self {
        match level {
            0 => ParallelDepth::Sequential,
            1 => ParallelDepth::Level1,
            _ => ParallelDepth::Nested,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    #[default]
    Static,
    StaticChunked,
    Dynamic,
    Guided,
    Runtime,
}

/// Work-sharing iteration state of one thread. Opaque to the dispatch code
/// beyond save/restore around serialized regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopState {
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub stride: i64,
    pub chunk: i64,
    pub schedule: Schedule,
}

/// Index of a context record in the block's `ContextArena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u32);

impl ContextId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskContext {
    /// Rank within the current team
    pub thread_id: u32,
    pub threads_in_team: u32,
    /// Cap inherited from the enclosing teams construct (0 = unset)
    pub thread_limit: u32,
    /// nthreads-var ICV: default request for the next region (0 = unset)
    pub nthreads_icv: u32,
    pub depth: ParallelDepth,
    /// Loop state of the owner, parked while a serialized region runs
    pub saved_loop: Option<LoopState>,
    pub parent: Option<ContextId>,
}

impl TaskContext {
    /// Outermost context created at kernel entry.
    pub fn initial(thread_limit: u32) -> Self {
        TaskContext {
            thread_id: 0,
            threads_in_team: 1,
            thread_limit,
            ..TaskContext::default()
        }
    }

    /// First-level context of an SPMD lane: every lane of the block is a member.
    pub fn spmd_level_one(thread_id: u32, team: u32, parent: ContextId, initial: &TaskContext) -> Self {
        TaskContext {
            thread_id,
            threads_in_team: team,
            depth: ParallelDepth::Level1,
            saved_loop: None,
            parent: Some(parent),
            ..initial.clone()
        }
    }

    /// Copy of `self` whose parent is `self_id`.
    pub fn child(&self, self_id: ContextId) -> Self {
        TaskContext {
            saved_loop: None,
            parent: Some(self_id),
            ..self.clone()
        }
    }

    /// Template every activated worker copies for a new level-1 team.
    pub fn team_template(&self, self_id: ContextId, team: u32) -> Self {
        TaskContext {
            threads_in_team: team,
            depth: ParallelDepth::Level1,
            ..self.child(self_id)
        }
    }

    /// Single-thread team for a serialized region.
    pub fn serialized(&self, self_id: ContextId) -> Self {
        TaskContext {
            thread_id: 0,
            threads_in_team: 1,
            depth: self.depth.deeper(),
            ..self.child(self_id)
        }
    }

    /// Context of a lane joining a convergent team on behalf of the source
    /// lane whose top context is `self`.
    pub fn convergent(&self, self_id: ContextId, rank: u32, team: u32) -> Self {
        TaskContext {
            thread_id: rank,
            threads_in_team: team,
            depth: self.depth.deeper(),
            ..self.child(self_id)
        }
    }
}

/// Block-wide storage for task contexts. Freed slots are recycled, so the
/// short-lived contexts of serialized and convergent regions do not grow it.
#[derive(Debug, Default)]
pub struct ContextArena {
    slots: Vec<Option<TaskContext>>,
    free: Vec<u32>,
}

impl ContextArena {
    pub fn with_capacity(capacity: usize) -> Self {
        ContextArena {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
        }
    }

    pub fn alloc(&mut self, ctx: TaskContext) -> ContextId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(ctx);
                ContextId(idx)
            }
            None => {
                self.slots.push(Some(ctx));
                ContextId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn release(&mut self, id: ContextId) -> Option<TaskContext> {
        let ctx = self.slots.get_mut(id.index())?.take()?;
        self.free.push(id.0);
        Some(ctx)
    }

    pub fn get(&self, id: ContextId) -> Option<&TaskContext> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut TaskContext> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Replace the record in a live slot, keeping its id.
    pub fn overwrite(&mut self, id: ContextId, ctx: TaskContext) -> bool {
        match self.slots.get_mut(id.index()) {
            Some(slot) if slot.is_some() => {
                *slot = Some(ctx);
                true
            }
            _ => false,
        }
    }

    /// Number of live records.
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_saturates_at_nested() {
        let d = ParallelDepth::Sequential;
        assert_eq!(d.deeper().level(), 1);
        assert_eq!(d.deeper().deeper().level(), 2);
        assert_eq!(d.deeper().deeper().deeper().level(), 2);
        assert_eq!(ParallelDepth::from_level(7), ParallelDepth::Nested);
    }

    #[test]
    fn arena_recycles_released_slots() {
        let mut arena = ContextArena::with_capacity(4);
        let a = arena.alloc(TaskContext::initial(0));
        let b = arena.alloc(TaskContext::initial(8));
        assert_eq!(arena.live(), 2);
        assert_eq!(arena.release(b).map(|c| c.thread_limit), Some(8));
        assert!(arena.release(b).is_none());
        let c = arena.alloc(TaskContext::initial(4));
        assert_eq!(c, b);
        assert_eq!(arena.live(), 2);
        assert!(arena.get(a).is_some());
    }

    #[test]
    fn serialized_child_is_single_thread_team() {
        let mut arena = ContextArena::default();
        let root = TaskContext { thread_id: 5, threads_in_team: 64, ..TaskContext::initial(0) };
        let id = arena.alloc(root.clone());
        let child = root.serialized(id);
        assert_eq!(child.thread_id, 0);
        assert_eq!(child.threads_in_team, 1);
        assert_eq!(child.depth, ParallelDepth::Level1);
        assert_eq!(child.parent, Some(id));
    }
}
