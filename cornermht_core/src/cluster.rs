//! Clusters: groups of track trees competing for the same reports.
//!
//! Two trees belong to one cluster when some leaf of each validates a
//! common report in the current scan. Each cluster poses a
//! generalised-assignment problem over its leaf continuations and
//! reports, ranks the K best global hypotheses, and keeps those within
//! the configured ratio of the best. Track scores are log-likelihood
//! ratios against the all-false-alarm baseline, so an unclaimed report
//! scores zero and a not-yet-committed tree carries an explicit
//! zero-score "spurious" alternative.

use std::collections::{BTreeMap, BTreeSet};

use crate::assign::{k_best_assignments, ScoredOption};
use crate::motion::KalmanState;
use crate::report::ReportId;
use crate::tree::{NodeId, TrackId};

/// One candidate continuation inside a cluster's assignment problem.
#[derive(Debug)]
pub enum OptionKind {
    /// Extend a leaf with a validated report.
    Extend {
        tree: TrackId,
        leaf: NodeId,
        report: ReportId,
        measurement: (f64, f64),
        state: Option<KalmanState>,
    },
    /// Extend a leaf with a skipped measurement.
    Skip {
        tree: TrackId,
        leaf: NodeId,
        state: Option<KalmanState>,
    },
    /// The track ends at this leaf.
    End { tree: TrackId, leaf: NodeId },
    /// Keep holding a leaf that already ended.
    Hold { tree: TrackId, leaf: NodeId },
    /// The tree never existed; its reports revert to the baseline.
    Spurious { tree: TrackId },
    /// The report starts a new track.
    Start {
        report: ReportId,
        measurement: (f64, f64),
        state: Option<KalmanState>,
    },
}

impl OptionKind {
    pub fn tree(&self) -> Option<TrackId> {
        match self {
            OptionKind::Extend { tree, .. }
            | OptionKind::Skip { tree, .. }
            | OptionKind::End { tree, .. }
            | OptionKind::Hold { tree, .. }
            | OptionKind::Spurious { tree } => Some(*tree),
            OptionKind::Start { .. } => None,
        }
    }

    fn leaf(&self) -> Option<NodeId> {
        match self {
            OptionKind::Extend { leaf, .. }
            | OptionKind::Skip { leaf, .. }
            | OptionKind::End { leaf, .. }
            | OptionKind::Hold { leaf, .. } => Some(*leaf),
            _ => None,
        }
    }

    pub fn report(&self) -> Option<ReportId> {
        match self {
            OptionKind::Extend { report, .. } | OptionKind::Start { report, .. } => Some(*report),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            OptionKind::Extend { .. } => 0,
            OptionKind::Skip { .. } => 1,
            OptionKind::End { .. } => 2,
            OptionKind::Hold { .. } => 3,
            OptionKind::Spurious { .. } => 4,
            OptionKind::Start { .. } => 5,
        }
    }
}

#[derive(Debug)]
pub struct ClusterOption {
    pub kind: OptionKind,
    /// Leaf cumulative score plus the edge's log-likelihood ratio.
    pub score: f64,
}

impl ClusterOption {
    /// Deterministic ordering: (tree, leaf, kind, report).
    fn key(&self) -> (u64, u64, u8, (usize, usize)) {
        let tree = self.kind.tree().map_or(u64::MAX, u64::from);
        let leaf = self.kind.leaf().map_or(u64::MAX, |l| u64::from(l.0));
        let report = self
            .kind
            .report()
            .map_or((usize::MAX, usize::MAX), |r| (r.scan, r.index));
        (tree, leaf, self.kind.rank(), report)
    }
}

/// One retained global hypothesis: chosen option indices (into the
/// problem's canonical option list) and the total log-likelihood ratio.
#[derive(Debug, Clone)]
pub struct RankedHypothesis {
    pub log_likelihood: f64,
    pub chosen: Vec<usize>,
}

/// The assignment problem one cluster poses for one scan.
#[derive(Debug)]
pub struct ClusterProblem {
    pub trees: Vec<TrackId>,
    pub reports: Vec<ReportId>,
    pub options: Vec<ClusterOption>,
}

impl ClusterProblem {
    /// Builds a problem with options in canonical order.
    pub fn new(trees: Vec<TrackId>, reports: Vec<ReportId>, mut options: Vec<ClusterOption>) -> Self {
        debug_assert!(trees.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(reports.windows(2).all(|w| w[0] < w[1]));
        options.sort_by_key(|o| o.key());
        Self { trees, reports, options }
    }

    /// Ranks the K best global hypotheses and keeps those whose
    /// likelihood is within `min_ratio` of the best. Returns `None`
    /// when the cluster admits no viable assignment.
    pub fn solve(&self, max_hypos: usize, min_ratio: f64) -> Option<Vec<RankedHypothesis>> {
        let tree_slot: BTreeMap<TrackId, usize> =
            self.trees.iter().enumerate().map(|(i, &t)| (t, i)).collect();
        let report_slot: BTreeMap<ReportId, usize> =
            self.reports.iter().enumerate().map(|(i, &r)| (r, i)).collect();

        let scored: Vec<ScoredOption> = self
            .options
            .iter()
            .map(|o| ScoredOption {
                row: o.kind.tree().map(|t| tree_slot[&t]),
                col: o.kind.report().map(|r| report_slot[&r]),
                score: o.score,
            })
            .collect();

        let ranked =
            k_best_assignments(&scored, self.trees.len(), self.reports.len(), max_hypos)?;

        let best = ranked[0].score;
        let cutoff = best + min_ratio.ln();
        Some(
            ranked
                .into_iter()
                .filter(|a| a.score >= cutoff)
                .map(|a| RankedHypothesis { log_likelihood: a.score, chosen: a.chosen })
                .collect(),
        )
    }
}

/// Partitions trees and reports into clusters: trees sharing a
/// validated report merge, reports validated by nobody (but still
/// carrying start options) form singleton clusters.
pub fn partition_components(
    tree_edges: &BTreeMap<TrackId, BTreeSet<ReportId>>,
    standalone_reports: &BTreeSet<ReportId>,
) -> Vec<(Vec<TrackId>, Vec<ReportId>)> {
    let trees: Vec<TrackId> = tree_edges.keys().copied().collect();
    let mut reports: BTreeSet<ReportId> = standalone_reports.clone();
    for edges in tree_edges.values() {
        reports.extend(edges.iter().copied());
    }
    let reports: Vec<ReportId> = reports.into_iter().collect();
    let report_slot: BTreeMap<ReportId, usize> =
        reports.iter().enumerate().map(|(i, &r)| (r, i)).collect();

    let mut uf = UnionFind::new(trees.len() + reports.len());
    for (ti, tree) in trees.iter().enumerate() {
        for rid in &tree_edges[tree] {
            uf.union(ti, trees.len() + report_slot[rid]);
        }
    }

    let mut components: BTreeMap<usize, (Vec<TrackId>, Vec<ReportId>)> = BTreeMap::new();
    for (ti, &tree) in trees.iter().enumerate() {
        components.entry(uf.find(ti)).or_default().0.push(tree);
    }
    for (ri, &rid) in reports.iter().enumerate() {
        components.entry(uf.find(trees.len() + ri)).or_default().1.push(rid);
    }
    components.into_values().collect()
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller root wins, keeping component labels stable.
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}
