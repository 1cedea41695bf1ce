use crate::{
    BatchJob, Error, ExecutionContext, JointCache, JointHierarchy, OutputMask, SegmentMask,
};
use std::sync::Arc;

/// Execution contexts of one frame, indexed by character slot, plus the previous frame's.
#[derive(Debug, Default)]
pub struct ContextPool {
    current: Vec<Option<ExecutionContext>>,
    previous: Vec<Option<ExecutionContext>>,
    frame: u64,
}

fn empty_slots(count: usize) -> Vec<Option<ExecutionContext>> {
    (0..count).map(|_| None).collect()
}

impl ContextPool {
    pub fn new(num_slots: usize) -> Self {
        Self {
            current: empty_slots(num_slots),
            previous: empty_slots(num_slots),
            frame: 0,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.current.len()
    }

    /// Number of [`ContextPool::begin_frame`] calls so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Retires this frame's contexts to "previous" and drops the older ones.
    pub fn begin_frame(&mut self) {
        let fresh = empty_slots(self.current.len());
        self.previous = std::mem::replace(&mut self.current, fresh);
        self.frame += 1;
    }

    /// Creates the slot's context for this frame. Persistent data carries over from the
    /// previous frame when the character kept its hierarchy.
    pub fn allocate(
        &mut self,
        slot: usize,
        hierarchy: Arc<JointHierarchy>,
    ) -> Result<&mut ExecutionContext, Error> {
        self.allocate_with_cache(slot, hierarchy, JointCache::default())
    }

    /// Like [`ContextPool::allocate`], with segment 0 buffers taken over from `cache`.
    pub fn allocate_with_cache(
        &mut self,
        slot: usize,
        hierarchy: Arc<JointHierarchy>,
        cache: JointCache,
    ) -> Result<&mut ExecutionContext, Error> {
        let persistent_data = match previous_for(&self.previous, slot, &hierarchy) {
            Some(prev) => prev.persistent_data().to_vec(),
            None => hierarchy.initial_persistent_data().to_vec(),
        };
        let Some(entry) = self.current.get_mut(slot).filter(|c| c.is_none()) else {
            return Err(Error::ContextSlot { slot });
        };
        let ctx = ExecutionContext::with_joint_cache(hierarchy, persistent_data, cache)?;
        log::trace!("frame {}: allocated context for slot {slot}", self.frame);
        Ok(entry.insert(ctx))
    }

    pub fn get(&self, slot: usize) -> Option<&ExecutionContext> {
        self.current.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ExecutionContext> {
        self.current.get_mut(slot)?.as_mut()
    }

    /// The slot's context from the previous frame, if it had one.
    pub fn previous(&self, slot: usize) -> Option<&ExecutionContext> {
        self.previous.get(slot)?.as_ref()
    }

    /// The slot's current context and, if it ran on the same hierarchy, its previous one.
    pub fn pair_mut(
        &mut self,
        slot: usize,
    ) -> Option<(&mut ExecutionContext, Option<&ExecutionContext>)> {
        let ctx = self.current.get_mut(slot)?.as_mut()?;
        let prev = previous_for(&self.previous, slot, ctx.hierarchy());
        Some((ctx, prev))
    }

    /// Builds a [`BatchJob`] for every allocated slot `request` returns masks for.
    pub fn batch_jobs(
        &mut self,
        mut request: impl FnMut(usize, &ExecutionContext) -> Option<(SegmentMask, OutputMask)>,
    ) -> Vec<BatchJob<'_>> {
        let previous = &self.previous;
        self.current
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, ctx)| {
                let ctx = ctx.as_mut()?;
                let (required, outputs) = request(slot, ctx)?;
                let prev = previous_for(previous, slot, ctx.hierarchy());
                Some(BatchJob {
                    ctx,
                    prev,
                    required,
                    outputs,
                })
            })
            .collect()
    }
}

fn previous_for<'a>(
    previous: &'a [Option<ExecutionContext>],
    slot: usize,
    hierarchy: &JointHierarchy,
) -> Option<&'a ExecutionContext> {
    previous
        .get(slot)?
        .as_ref()
        .filter(|p| p.hierarchy().hierarchy_id() == hierarchy.hierarchy_id())
}
