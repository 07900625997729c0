use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Index of a node in the job DAG. Nodes are numbered from 1.
pub type DagNodeId = u32;

/// Progress of one DAG node.
///
/// A node starts `NotReady`, becomes `Active` once every predecessor is
/// `Complete`, and completes once the queen has no more jobs for it and none of
/// its handed-out jobs remain outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    NotReady,
    Active { exhausted: bool, outstanding: usize },
    Complete,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("job DAG has no node {0}")]
    UnknownNode(DagNodeId),

    #[error("cannot add edge {from} -> {to}: node {to} has already started")]
    NodeStarted { from: DagNodeId, to: DagNodeId },

    #[error("cannot add edge {from} -> {to}: it would create a cycle")]
    Cycle { from: DagNodeId, to: DagNodeId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DagNode {
    predecessors: BTreeSet<DagNodeId>,
    state: NodeState,
}

/// Directed acyclic graph of job batches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDigraph {
    nodes: Vec<DagNode>,
}

impl JobDigraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(count: u32) -> Self {
        let mut dag = Self::new();
        for _ in 0..count {
            dag.add_node();
        }
        dag
    }

    pub fn add_node(&mut self) -> DagNodeId {
        self.nodes.push(DagNode {
            predecessors: BTreeSet::new(),
            state: NodeState::NotReady,
        });
        self.nodes.len() as DagNodeId
    }

    /// Jobs of `to` will only be requested once `from` has completed.
    pub fn add_edge(&mut self, from: DagNodeId, to: DagNodeId) -> Result<(), DagError> {
        self.node(from).ok_or(DagError::UnknownNode(from))?;
        let target = self.node(to).ok_or(DagError::UnknownNode(to))?;
        if target.state != NodeState::NotReady {
            return Err(DagError::NodeStarted { from, to });
        }
        if from == to || self.is_ancestor(to, from) {
            return Err(DagError::Cycle { from, to });
        }
        if let Some(target) = self.node_mut(to) {
            target.predecessors.insert(from);
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn state(&self, id: DagNodeId) -> Option<NodeState> {
        self.node(id).map(|node| node.state)
    }

    pub fn predecessors(&self, id: DagNodeId) -> Vec<DagNodeId> {
        self.node(id)
            .map(|node| node.predecessors.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all_complete(&self) -> bool {
        self.nodes
            .iter()
            .all(|node| node.state == NodeState::Complete)
    }

    /// Mark every not-ready node whose predecessors have all completed as active.
    pub(crate) fn activate_ready_nodes(&mut self) -> Vec<DagNodeId> {
        let ready: Vec<DagNodeId> = self
            .ids()
            .filter(|&id| {
                self.state(id) == Some(NodeState::NotReady)
                    && self
                        .predecessors(id)
                        .iter()
                        .all(|&pred| self.state(pred) == Some(NodeState::Complete))
            })
            .collect();
        for &id in &ready {
            self.set_state(
                id,
                NodeState::Active {
                    exhausted: false,
                    outstanding: 0,
                },
            );
        }
        ready
    }

    /// Lowest-numbered active node that may still have jobs to hand out.
    pub(crate) fn next_unexhausted(&self) -> Option<DagNodeId> {
        self.ids().find(|&id| {
            matches!(
                self.state(id),
                Some(NodeState::Active {
                    exhausted: false,
                    ..
                })
            )
        })
    }

    pub(crate) fn add_outstanding(&mut self, id: DagNodeId, count: usize) {
        if let Some(NodeState::Active { exhausted, outstanding }) = self.state(id) {
            self.set_state(
                id,
                NodeState::Active {
                    exhausted,
                    outstanding: outstanding + count,
                },
            );
        }
    }

    pub(crate) fn finish_job(&mut self, id: DagNodeId) {
        if let Some(NodeState::Active { exhausted, outstanding }) = self.state(id) {
            self.set_state(
                id,
                NodeState::Active {
                    exhausted,
                    outstanding: outstanding.saturating_sub(1),
                },
            );
        }
    }

    pub(crate) fn mark_exhausted(&mut self, id: DagNodeId) {
        if let Some(NodeState::Active { outstanding, .. }) = self.state(id) {
            self.set_state(
                id,
                NodeState::Active {
                    exhausted: true,
                    outstanding,
                },
            );
        }
    }

    /// Complete the node if it is exhausted with nothing outstanding.
    pub(crate) fn try_complete(&mut self, id: DagNodeId) -> bool {
        if self.state(id)
            == Some(NodeState::Active {
                exhausted: true,
                outstanding: 0,
            })
        {
            self.set_state(id, NodeState::Complete);
            true
        } else {
            false
        }
    }

    fn ids(&self) -> impl Iterator<Item = DagNodeId> {
        1..=self.nodes.len() as DagNodeId
    }

    fn node(&self, id: DagNodeId) -> Option<&DagNode> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.nodes.get(index)
    }

    fn node_mut(&mut self, id: DagNodeId) -> Option<&mut DagNode> {
        let index = usize::try_from(id).ok()?.checked_sub(1)?;
        self.nodes.get_mut(index)
    }

    fn set_state(&mut self, id: DagNodeId, state: NodeState) {
        if let Some(node) = self.node_mut(id) {
            node.state = state;
        }
    }

    /// True if `ancestor` can reach `id` by following edges forward.
    fn is_ancestor(&self, ancestor: DagNodeId, id: DagNodeId) -> bool {
        let mut stack = self.predecessors(id);
        let mut seen = BTreeSet::new();
        while let Some(next) = stack.pop() {
            if next == ancestor {
                return true;
            }
            if seen.insert(next) {
                stack.extend(self.predecessors(next));
            }
        }
        false
    }
}

/// Restricted view of the DAG handed to the queen when a node completes.
pub struct JobDagUpdater<'a> {
    dag: &'a mut JobDigraph,
}

impl<'a> JobDagUpdater<'a> {
    pub(crate) fn new(dag: &'a mut JobDigraph) -> Self {
        Self { dag }
    }

    pub fn add_node(&mut self) -> DagNodeId {
        self.dag.add_node()
    }

    pub fn add_edge(&mut self, from: DagNodeId, to: DagNodeId) -> Result<(), DagError> {
        self.dag.add_edge(from, to)
    }

    pub fn num_nodes(&self) -> usize {
        self.dag.num_nodes()
    }

    pub fn state(&self, id: DagNodeId) -> Option<NodeState> {
        self.dag.state(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roots_activate_first() {
        let mut dag = JobDigraph::with_nodes(3);
        dag.add_edge(1, 3).unwrap();
        dag.add_edge(2, 3).unwrap();

        assert_eq!(dag.activate_ready_nodes(), vec![1, 2]);
        assert_eq!(dag.state(3), Some(NodeState::NotReady));
        assert_eq!(dag.next_unexhausted(), Some(1));
    }

    #[test]
    fn test_node_waits_for_every_predecessor() {
        let mut dag = JobDigraph::with_nodes(3);
        dag.add_edge(1, 3).unwrap();
        dag.add_edge(2, 3).unwrap();
        dag.activate_ready_nodes();

        dag.mark_exhausted(1);
        assert!(dag.try_complete(1));
        assert!(dag.activate_ready_nodes().is_empty());

        dag.mark_exhausted(2);
        assert!(dag.try_complete(2));
        assert_eq!(dag.activate_ready_nodes(), vec![3]);
    }

    #[test]
    fn test_outstanding_jobs_block_completion() {
        let mut dag = JobDigraph::with_nodes(1);
        dag.activate_ready_nodes();
        dag.add_outstanding(1, 2);
        dag.mark_exhausted(1);
        assert!(!dag.try_complete(1));

        dag.finish_job(1);
        assert!(!dag.try_complete(1));
        dag.finish_job(1);
        assert!(dag.try_complete(1));
        assert!(dag.all_complete());
    }

    #[test]
    fn test_cycles_and_started_nodes_are_rejected() {
        let mut dag = JobDigraph::with_nodes(3);
        dag.add_edge(1, 2).unwrap();
        dag.add_edge(2, 3).unwrap();
        assert_eq!(dag.add_edge(3, 1), Err(DagError::Cycle { from: 3, to: 1 }));
        assert_eq!(dag.add_edge(2, 2), Err(DagError::Cycle { from: 2, to: 2 }));
        assert_eq!(dag.add_edge(1, 9), Err(DagError::UnknownNode(9)));

        dag.activate_ready_nodes();
        let fresh = dag.add_node();
        assert_eq!(
            dag.add_edge(fresh, 1),
            Err(DagError::NodeStarted { from: fresh, to: 1 })
        );
    }

    #[test]
    fn test_updater_extends_graph_after_completion() {
        let mut dag = JobDigraph::with_nodes(1);
        dag.activate_ready_nodes();
        dag.mark_exhausted(1);
        dag.try_complete(1);

        let mut updater = JobDagUpdater::new(&mut dag);
        let next = updater.add_node();
        updater.add_edge(1, next).unwrap();
        assert_eq!(updater.num_nodes(), 2);

        assert_eq!(dag.activate_ready_nodes(), vec![2]);
    }
}
