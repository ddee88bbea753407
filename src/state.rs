/// Per-block shared state, indexed by logical thread id. Lives for one kernel
/// launch: top-of-stack contexts, pre-allocated level-1 contexts, one-shot
/// hints for the next region and the degenerate-mode nesting counters.
use crate::context::{ContextArena, ContextId, LoopState, TaskContext};
use crate::error::DispatchError;

#[derive(Debug)]
pub struct PerBlockState {
    pub arena: ContextArena,
    top: Vec<Option<ContextId>>,
    level1: Vec<ContextId>,
    pending_num_threads: Vec<u32>,
    pending_simd_width: Vec<u32>,
    loop_state: Vec<LoopState>,
    private_event: Vec<u64>,
    /// Nesting depth per thread when the runtime is uninitialized
    simple_level: Vec<u32>,
}

impl PerBlockState {
    /// State for `threads` logical threads with no context stacks at all
    /// (uninitialized runtime).
    pub fn simple(threads: usize) -> Self {
        PerBlockState {
            arena: ContextArena::default(),
            top: vec![None; threads],
            level1: Vec::new(),
            pending_num_threads: vec![0; threads],
            pending_simd_width: vec![0; threads],
            loop_state: vec![LoopState::default(); threads],
            private_event: vec![0; threads],
            simple_level: vec![0; threads],
        }
    }

    /// State with context stacks: one initial context shared as the bottom
    /// of every thread's stack, plus a level-1 slot per thread.
    pub fn with_stacks(threads: usize, initial: TaskContext) -> Self {
        let mut state = PerBlockState::simple(threads);
        state.arena = ContextArena::with_capacity(2 * threads + 1);
        let root = state.arena.alloc(initial);
        state.top = vec![Some(root); threads];
        state.level1 = (0..threads)
            .map(|_| state.arena.alloc(TaskContext::default()))
            .collect();
        state
    }

    pub fn threads(&self) -> usize {
        self.top.len()
    }

    pub fn top(&self, tid: u32) -> Result<ContextId, DispatchError> {
        self.top
            .get(tid as usize)
            .copied()
            .flatten()
            .ok_or(DispatchError::ContextUnderflow { thread: tid })
    }

    pub fn set_top(&mut self, tid: u32, id: ContextId) {
        if let Some(slot) = self.top.get_mut(tid as usize) {
            *slot = Some(id);
        }
    }

    pub fn context(&self, id: ContextId) -> Result<&TaskContext, DispatchError> {
        self.arena
            .get(id)
            .ok_or(DispatchError::ContextUnderflow { thread: u32::MAX })
    }

    pub fn top_context(&self, tid: u32) -> Result<&TaskContext, DispatchError> {
        let id = self.top(tid)?;
        self.arena
            .get(id)
            .ok_or(DispatchError::ContextUnderflow { thread: tid })
    }

    pub fn top_context_mut(&mut self, tid: u32) -> Result<&mut TaskContext, DispatchError> {
        let id = self.top(tid)?;
        self.arena
            .get_mut(id)
            .ok_or(DispatchError::ContextUnderflow { thread: tid })
    }

    pub fn level1(&self, tid: u32) -> Option<ContextId> {
        self.level1.get(tid as usize).copied()
    }

    /// Allocate `ctx` and make it the top of `tid`'s stack.
    pub fn push(&mut self, tid: u32, ctx: TaskContext) -> ContextId {
        let id = self.arena.alloc(ctx);
        self.set_top(tid, id);
        id
    }

    /// Make the parent of the current top the new top. Returns the popped id;
    /// the record itself is left in the arena for the caller to release.
    pub fn pop(&mut self, tid: u32) -> Result<ContextId, DispatchError> {
        let id = self.top(tid)?;
        let parent = self
            .context(id)?
            .parent
            .ok_or(DispatchError::ContextUnderflow { thread: tid })?;
        self.set_top(tid, parent);
        Ok(id)
    }

    pub fn pending_num_threads(&self, tid: u32) -> u32 {
        self.pending_num_threads.get(tid as usize).copied().unwrap_or(0)
    }

    pub fn pending_simd_width(&self, tid: u32) -> u32 {
        self.pending_simd_width.get(tid as usize).copied().unwrap_or(0)
    }

    pub fn set_pending_num_threads(&mut self, tid: u32, n: u32) {
        if let Some(slot) = self.pending_num_threads.get_mut(tid as usize) {
            *slot = n;
        }
    }

    pub fn set_pending_simd_width(&mut self, tid: u32, n: u32) {
        if let Some(slot) = self.pending_simd_width.get_mut(tid as usize) {
            *slot = n;
        }
    }

    /// Consume the pending `num_threads` hint, leaving 0 behind.
    pub fn take_pending_num_threads(&mut self, tid: u32) -> u32 {
        self.pending_num_threads
            .get_mut(tid as usize)
            .map(std::mem::take)
            .unwrap_or(0)
    }

    pub fn loop_state(&self, tid: u32) -> LoopState {
        self.loop_state.get(tid as usize).copied().unwrap_or_default()
    }

    pub fn loop_state_mut(&mut self, tid: u32) -> Option<&mut LoopState> {
        self.loop_state.get_mut(tid as usize)
    }

    pub fn private_event_mut(&mut self, tid: u32) -> Option<&mut u64> {
        self.private_event.get_mut(tid as usize)
    }

    pub fn simple_level(&self, tid: u32) -> u32 {
        self.simple_level.get(tid as usize).copied().unwrap_or(0)
    }

    pub fn simple_level_mut(&mut self, tid: u32) -> Option<&mut u32> {
        self.simple_level.get_mut(tid as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_stack_starts_at_the_initial_context() {
        let state = PerBlockState::with_stacks(4, TaskContext::initial(16));
        let root = state.top(0).unwrap();
        for tid in 1..4 {
            assert_eq!(state.top(tid).unwrap(), root);
        }
        assert_eq!(state.top_context(3).unwrap().thread_limit, 16);
        // root + four level-1 slots
        assert_eq!(state.arena.live(), 5);
    }

    #[test]
    fn pop_of_initial_context_underflows() {
        let mut state = PerBlockState::with_stacks(2, TaskContext::initial(0));
        assert!(matches!(
            state.pop(1),
            Err(DispatchError::ContextUnderflow { thread: 1 })
        ));
    }

    #[test]
    fn push_pop_restores_top() {
        let mut state = PerBlockState::with_stacks(2, TaskContext::initial(0));
        let before = state.top(1).unwrap();
        let child = state.top_context(1).unwrap().child(before);
        let pushed = state.push(1, child);
        assert_eq!(state.top(1).unwrap(), pushed);
        assert_eq!(state.pop(1).unwrap(), pushed);
        assert_eq!(state.top(1).unwrap(), before);
    }

    #[test]
    fn num_threads_hint_is_single_use() {
        let mut state = PerBlockState::simple(2);
        state.set_pending_num_threads(1, 12);
        assert_eq!(state.take_pending_num_threads(1), 12);
        assert_eq!(state.take_pending_num_threads(1), 0);
        assert!(state.top(0).is_err());
    }
}
