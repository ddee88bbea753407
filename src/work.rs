/// The work descriptor: the single record per block through which the master
/// hands a parallel region to the workers.
use std::num::NonZeroU32;

use crate::context::TaskContext;

/// Opaque handle of an outlined parallel region. The absence of a handle is
/// the termination signal for workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkFn(NonZeroU32);

impl WorkFn {
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(WorkFn)
    }

    pub fn id(self) -> u32 {
        self.0.get()
    }
}

/// Shared event counter used by work-sharing constructs nested in a region.
/// The sizing decision clears it; each activated worker seeds its private
/// counter from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterGroup {
    event: u64,
}

impl CounterGroup {
    pub fn clear(&mut self) {
        self.event = 0;
    }

    pub fn init(&self, private: &mut u64) {
        *private = self.event;
    }

    /// Claim the next shared event.
    pub fn next(&mut self) -> u64 {
        let current = self.event;
        self.event += 1;
        current
    }

    /// Advance a private counter by `n` completed events.
    pub fn complete(&self, private: &mut u64, n: u64) {
        *private += n;
    }

    pub fn current(&self) -> u64 {
        self.event
    }
}

#[derive(Debug, Default)]
pub struct WorkDescriptor {
    work_fn: Option<WorkFn>,
    template: TaskContext,
    team_size: u32,
    pub counters: CounterGroup,
}

impl WorkDescriptor {
    /// Publish a region: handle, agreed team size and the template context.
    pub fn publish(&mut self, work_fn: WorkFn, template: TaskContext) {
        self.work_fn = Some(work_fn);
        self.team_size = template.threads_in_team;
        self.template = template;
        self.counters.clear();
    }

    /// Publish the termination signal.
    pub fn terminate(&mut self) {
        self.work_fn = None;
    }

    pub fn work_fn(&self) -> Option<WorkFn> {
        self.work_fn
    }

    pub fn team_size(&self) -> u32 {
        self.team_size
    }

    pub fn template(&self) -> &TaskContext {
        &self.template
    }
}
