/// Node selection policies
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::SelectionPolicy;
use crate::core::Node;

/// Picks the node for the next attempt
///
/// `candidates` is already filtered to healthy nodes; an implementation
/// returns an index into it, or `None` to give up.
pub trait NodeManager: Send + Sync {
    fn select_node(&self, candidates: &[Arc<Node>]) -> Option<usize>;
}

/// Cycles through the candidates
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl NodeManager for RoundRobin {
    fn select_node(&self, candidates: &[Arc<Node>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(index)
    }
}

/// Picks the node with the fewest active executes, first one on ties
#[derive(Debug, Default)]
pub struct LeastActive;

impl LeastActive {
    pub fn new() -> Self {
        Self
    }
}

impl NodeManager for LeastActive {
    fn select_node(&self, candidates: &[Arc<Node>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, node)| node.active_count())
            .map(|(index, _)| index)
    }
}

/// Build the manager for a configured policy
pub fn create_node_manager(policy: SelectionPolicy) -> Box<dyn NodeManager> {
    match policy {
        SelectionPolicy::RoundRobin => Box::new(RoundRobin::new()),
        SelectionPolicy::LeastActive => Box::new(LeastActive::new()),
    }
}
