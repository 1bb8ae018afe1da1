/// Network fault fixtures
///
/// A `FaultPlan` tells a simulated router which deliveries to drop and
/// how many copies of each message to hand over.

use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    silenced: HashSet<usize>,
    duplicate: bool,
}

impl FaultPlan {
    /// Reliable, exactly-once delivery
    pub fn none() -> Self {
        Self::default()
    }

    /// Cut `node` off: nothing it sends or should receive is delivered
    pub fn silence(mut self, node: usize) -> Self {
        self.silenced.insert(node);
        self
    }

    /// Deliver every message twice
    pub fn duplicate(mut self) -> Self {
        self.duplicate = true;
        self
    }

    pub fn restore(&mut self, node: usize) {
        self.silenced.remove(&node);
    }

    pub fn is_silenced(&self, node: usize) -> bool {
        self.silenced.contains(&node)
    }

    pub fn delivers(&self, from: usize, to: usize) -> bool {
        from != to && !self.is_silenced(from) && !self.is_silenced(to)
    }

    /// Copies of each message to deliver
    pub fn copies(&self) -> usize {
        if self.duplicate {
            2
        } else {
            1
        }
    }
}
