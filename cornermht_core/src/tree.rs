//! Per-track hypothesis trees.
//!
//! Each track owns a tree of hypothesis nodes; every path from the root
//! to a leaf is one candidate history of (report, state) pairs. Nodes
//! live in an arena owned by the tree and refer to each other through
//! stable integer handles, so pruning is a constant-time mark per node
//! and cyclic topologies cannot arise.

use crate::motion::KalmanState;
use crate::report::ReportId;

pub type TrackId = u32;

/// Handle of a node within its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One hypothesis node: the report consumed to reach it (or a skip),
/// the state produced, and the cumulative path score.
#[derive(Debug)]
pub struct TrackNode {
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Report consumed by this hypothesis edge; `None` for skip edges
    /// and ended markers.
    pub report: Option<ReportId>,
    /// Raw measurement position, copied so emission doesn't depend on
    /// the report pool's lifetime.
    pub measurement: Option<(f64, f64)>,
    /// Scan ordinal this node belongs to.
    pub scan: usize,
    /// Input frame label of that scan.
    pub frame: usize,
    pub state: KalmanState,
    /// Log-likelihood ratio of the whole path from the track's start.
    pub cum_log_lik: f64,
    /// Terminal marker: the track ended before this scan.
    pub ended: bool,
    alive: bool,
}

/// A track's hypothesis tree. The root is the oldest node whose history
/// has not yet been committed by N-scan pruning.
#[derive(Debug)]
pub struct TrackTree {
    id: TrackId,
    nodes: Vec<TrackNode>,
    root: NodeId,
    /// Number of elements already emitted for this track.
    pub committed: usize,
}

impl TrackTree {
    /// Creates a tree rooted at a single starting hypothesis.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TrackId,
        scan: usize,
        frame: usize,
        report: ReportId,
        measurement: (f64, f64),
        state: KalmanState,
        cum_log_lik: f64,
    ) -> Self {
        let root = TrackNode {
            parent: None,
            children: Vec::new(),
            report: Some(report),
            measurement: Some(measurement),
            scan,
            frame,
            state,
            cum_log_lik,
            ended: false,
            alive: true,
        };
        Self { id, nodes: vec![root], root: NodeId(0), committed: 0 }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_scan(&self) -> usize {
        self.node(self.root).scan
    }

    pub fn is_empty(&self) -> bool {
        !self.nodes[self.root.idx()].alive
    }

    pub fn node(&self, id: NodeId) -> &TrackNode {
        let node = &self.nodes[id.idx()];
        debug_assert!(node.alive, "access to pruned node");
        node
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TrackNode {
        let node = &mut self.nodes[id.idx()];
        debug_assert!(node.alive, "access to pruned node");
        node
    }

    /// Appends a child hypothesis to a leaf.
    #[allow(clippy::too_many_arguments)]
    pub fn add_child(
        &mut self,
        parent: NodeId,
        report: Option<ReportId>,
        measurement: Option<(f64, f64)>,
        scan: usize,
        frame: usize,
        state: KalmanState,
        cum_log_lik: f64,
        ended: bool,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(TrackNode {
            parent: Some(parent),
            children: Vec::new(),
            report,
            measurement,
            scan,
            frame,
            state,
            cum_log_lik,
            ended,
            alive: true,
        });
        self.nodes[parent.idx()].children.push(id);
        id
    }

    /// All live leaves, in handle order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.alive && n.children.is_empty())
            .map(|(i, _)| NodeId(i as u32))
            .collect()
    }

    /// Prunes a leaf, collapsing any ancestors whose subtrees become
    /// empty. Pruning the last path kills the root and empties the tree.
    pub fn prune_leaf(&mut self, id: NodeId) {
        debug_assert!(self.nodes[id.idx()].children.is_empty());
        let mut cur = id;
        loop {
            let parent = self.nodes[cur.idx()].parent;
            self.nodes[cur.idx()].alive = false;
            match parent {
                Some(p) => {
                    self.nodes[p.idx()].children.retain(|&c| c != cur);
                    if !self.nodes[p.idx()].children.is_empty() {
                        break;
                    }
                    cur = p;
                }
                None => break,
            }
        }
    }

    /// Commits the root decision: `child` becomes the new root and every
    /// sibling subtree is pruned away.
    pub fn advance_root(&mut self, child: NodeId) {
        debug_assert_eq!(self.nodes[child.idx()].parent, Some(self.root));
        let siblings: Vec<NodeId> = self.nodes[self.root.idx()]
            .children
            .iter()
            .copied()
            .filter(|&c| c != child)
            .collect();
        for s in siblings {
            self.kill_subtree(s);
        }
        self.nodes[self.root.idx()].alive = false;
        self.nodes[child.idx()].parent = None;
        self.root = child;
        self.committed += 1;
    }

    fn kill_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            stack.extend(self.nodes[n.idx()].children.iter().copied());
            self.nodes[n.idx()].children.clear();
            self.nodes[n.idx()].alive = false;
        }
    }

    /// Nodes from the root down to `leaf`, inclusive.
    pub fn path_from_root(&self, leaf: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut cur = Some(leaf);
        while let Some(id) = cur {
            path.push(id);
            cur = self.nodes[id.idx()].parent;
        }
        path.reverse();
        debug_assert_eq!(path.first(), Some(&self.root));
        path
    }

    /// The root's child on the path down to `leaf`.
    pub fn root_child_towards(&self, leaf: NodeId) -> Option<NodeId> {
        let mut cur = leaf;
        loop {
            match self.nodes[cur.idx()].parent {
                Some(p) if p == self.root => return Some(cur),
                Some(p) => cur = p,
                None => return None,
            }
        }
    }

    #[cfg(test)]
    fn alive_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.alive).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerParams;
    use crate::motion::MotionModel;
    use crate::patch::Patch;
    use crate::report::Report;

    fn state() -> KalmanState {
        let model = MotionModel::new(&TrackerParams::default());
        model.initial_state(&Report {
            frame: 0,
            x: 1.0,
            y: 2.0,
            patch: Patch::flat(7),
            falarm_log_lik: -3.0,
        })
    }

    fn rid(scan: usize, index: usize) -> ReportId {
        ReportId { scan, index }
    }

    fn tree() -> TrackTree {
        TrackTree::new(1, 0, 0, rid(0, 0), (1.0, 2.0), state(), 0.5)
    }

    #[test]
    fn new_tree_is_a_single_leaf() {
        let t = tree();
        assert_eq!(t.leaves(), vec![NodeId(0)]);
        assert_eq!(t.root(), NodeId(0));
        assert!(!t.is_empty());
    }

    #[test]
    fn children_become_leaves() {
        let mut t = tree();
        let a = t.add_child(t.root(), Some(rid(1, 0)), Some((2.0, 2.0)), 1, 1, state(), 1.0, false);
        let b = t.add_child(t.root(), None, None, 1, 1, state(), 0.2, false);
        assert_eq!(t.leaves(), vec![a, b]);
        assert_eq!(t.node(a).parent, Some(t.root()));
    }

    #[test]
    fn pruning_collapses_empty_ancestors() {
        let mut t = tree();
        let a = t.add_child(t.root(), Some(rid(1, 0)), Some((2.0, 2.0)), 1, 1, state(), 1.0, false);
        let b = t.add_child(t.root(), None, None, 1, 1, state(), 0.2, false);
        let aa = t.add_child(a, None, None, 2, 2, state(), 1.1, false);

        // Removing the grandchild removes its childless parent too.
        t.prune_leaf(aa);
        assert_eq!(t.leaves(), vec![b]);

        // Removing the last leaf empties the tree.
        t.prune_leaf(b);
        assert!(t.is_empty());
    }

    #[test]
    fn advance_root_commits_one_branch() {
        let mut t = tree();
        let a = t.add_child(t.root(), Some(rid(1, 0)), Some((2.0, 2.0)), 1, 1, state(), 1.0, false);
        let b = t.add_child(t.root(), None, None, 1, 1, state(), 0.2, false);
        let aa = t.add_child(a, Some(rid(2, 0)), Some((3.0, 2.0)), 2, 2, state(), 2.0, false);
        let _bb = t.add_child(b, None, None, 2, 2, state(), 0.1, false);

        t.advance_root(a);
        assert_eq!(t.root(), a);
        assert_eq!(t.committed, 1);
        assert_eq!(t.leaves(), vec![aa]);
        assert_eq!(t.alive_count(), 2);
        assert_eq!(t.node(a).parent, None);
    }

    #[test]
    fn path_walks_root_to_leaf() {
        let mut t = tree();
        let a = t.add_child(t.root(), None, None, 1, 1, state(), 0.1, false);
        let aa = t.add_child(a, None, None, 2, 2, state(), 0.2, false);
        assert_eq!(t.path_from_root(aa), vec![NodeId(0), a, aa]);
        assert_eq!(t.root_child_towards(aa), Some(a));
        assert_eq!(t.root_child_towards(t.root()), None);
    }
}
