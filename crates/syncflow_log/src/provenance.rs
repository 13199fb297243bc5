//! Lineage queries over the action log.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::log::ActionLog;
use crate::record::{ActionRecord, RecordId};

/// One rule firing as seen from either end of its edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    /// Rule that fired.
    pub rule: String,
    /// Matched completions.
    pub sources: Vec<RecordId>,
    /// Produced invocations.
    pub produced: Vec<RecordId>,
}

/// Read-only view answering "why did this happen" and "what did this cause".
#[derive(Debug, Clone)]
pub struct ProvenanceGraph {
    log: Arc<ActionLog>,
}

impl ProvenanceGraph {
    /// Creates a view over `log`.
    #[must_use]
    pub fn new(log: Arc<ActionLog>) -> Self {
        Self { log }
    }

    /// Returns the records that caused `id`, nearest first.
    ///
    /// Follows parent links and provenance edges breadth-first. `depth`
    /// limits the number of hops; `None` walks to the flow root.
    #[must_use]
    pub fn ancestors(&self, id: &RecordId, depth: Option<usize>) -> Vec<Arc<ActionRecord>> {
        self.walk(id, depth, |log, id| log.causes_of(id))
    }

    /// Returns the records caused by `id`, nearest first.
    #[must_use]
    pub fn descendants(&self, id: &RecordId, depth: Option<usize>) -> Vec<Arc<ActionRecord>> {
        self.walk(id, depth, |log, id| log.effects_of(id))
    }

    /// Returns the firing that produced `invocation`, if a rule produced it.
    #[must_use]
    pub fn produced_by(&self, invocation: &RecordId) -> Option<Firing> {
        let edges = self.log.edges_to(invocation);
        let rule = edges.first()?.rule.clone();
        let sources = edges
            .iter()
            .filter(|e| e.rule == rule)
            .map(|e| e.source)
            .collect();
        Some(Firing {
            rule,
            sources,
            produced: vec![*invocation],
        })
    }

    /// Returns the firings that matched `completion`, in commit order.
    ///
    /// Invocations committed together over the same matched set are grouped
    /// into one firing.
    #[must_use]
    pub fn fired_from(&self, completion: &RecordId) -> Vec<Firing> {
        let mut firings: Vec<Firing> = Vec::new();
        for edge in self.log.edges_from(completion) {
            let Some(found) = self.produced_by(&edge.produced) else {
                continue;
            };
            match firings
                .iter_mut()
                .find(|f| f.rule == found.rule && same_set(&f.sources, &found.sources))
            {
                Some(existing) => {
                    if !existing.produced.contains(&edge.produced) {
                        existing.produced.push(edge.produced);
                    }
                }
                None => firings.push(found),
            }
        }
        firings
    }

    fn walk<F>(&self, start: &RecordId, depth: Option<usize>, next: F) -> Vec<Arc<ActionRecord>>
    where
        F: Fn(&ActionLog, &RecordId) -> Vec<RecordId>,
    {
        let mut visited = HashSet::new();
        visited.insert(*start);
        let mut queue = VecDeque::new();
        queue.push_back((*start, 0usize));
        let mut out = Vec::new();

        while let Some((id, hops)) = queue.pop_front() {
            if depth.is_some_and(|max| hops >= max) {
                continue;
            }
            for neighbour in next(&self.log, &id) {
                if visited.insert(neighbour) {
                    if let Some(record) = self.log.get(&neighbour) {
                        out.push(record);
                    }
                    queue.push_back((neighbour, hops + 1));
                }
            }
        }
        out
    }
}

fn same_set(a: &[RecordId], b: &[RecordId]) -> bool {
    a.len() == b.len() && a.iter().all(|id| b.contains(id))
}
