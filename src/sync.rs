/// Block-wide barrier accounting.
/// Lanes of a block only synchronize at barriers; every participating lane
/// must arrive the same number of times whether or not it joined the region,
/// otherwise later barriers pair up the wrong phases.
use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct BlockBarrier {
    /// Arrivals per hardware lane; `None` for lanes that never take part
    arrivals: Vec<Option<u64>>,
}

impl BlockBarrier {
    pub fn new<I: IntoIterator<Item = u32>>(block_size: u32, participants: I) -> Self {
        let mut arrivals = vec![None; block_size as usize];
        for lane in participants {
            if let Some(slot) = arrivals.get_mut(lane as usize) {
                *slot = Some(0);
            }
        }
        BlockBarrier { arrivals }
    }

    pub fn arrive(&mut self, lane: u32) {
        if let Some(Some(count)) = self.arrivals.get_mut(lane as usize) {
            *count += 1;
        }
    }

    /// Every participant arrives (one `__syncthreads()` phase).
    pub fn sync_all(&mut self) {
        for count in self.arrivals.iter_mut().flatten() {
            *count += 1;
        }
    }

    pub fn arrivals(&self, lane: u32) -> Option<u64> {
        self.arrivals.get(lane as usize).copied().flatten()
    }

    /// Per-lane arrivals, 0 for non-participants.
    pub fn counts(&self) -> Vec<u64> {
        self.arrivals.iter().map(|a| a.unwrap_or(0)).collect()
    }

    pub fn check_aligned(&self) -> Result<u64, DispatchError> {
        let mut participants = self.arrivals.iter().flatten();
        let Some(&first) = participants.next() else {
            return Ok(0);
        };
        let (min, max) = participants.fold((first, first), |(lo, hi), &c| (lo.min(c), hi.max(c)));
        if min != max {
            return Err(DispatchError::BarrierMisaligned { min, max });
        }
        Ok(min)
    }
}
