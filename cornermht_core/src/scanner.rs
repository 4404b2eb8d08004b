//! The scan loop: ingest reports, extend trees, rank hypotheses,
//! N-scan prune, emit.
//!
//! The scanner owns every per-scan resource the original design kept in
//! process globals: the report pools of the sliding window, the track
//! trees, the clusters of the current scan and the emission buffers.
//! One scan runs to completion before the next frame is accepted.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::cluster::{partition_components, ClusterOption, ClusterProblem, OptionKind};
use crate::config::TrackerParams;
use crate::motion::MotionModel;
use crate::report::{Report, ReportId, ReportPool};
use crate::tree::{NodeId, TrackId, TrackTree};

/// Lifecycle of the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    FirstScan,
    Steady,
    Draining,
    Done,
}

/// One committed element of a track's history.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmedElement {
    pub track_id: TrackId,
    /// Input frame label.
    pub frame: usize,
    /// Scan ordinal.
    pub time: usize,
    /// Raw measurement, `None` when the scan was skipped.
    pub measurement: Option<(f64, f64)>,
    /// Smoothed state position.
    pub sx: f64,
    pub sy: f64,
    pub log_likelihood: f64,
}

/// A report no surviving hypothesis ever claimed.
#[derive(Debug, Clone, Serialize)]
pub struct FalseAlarm {
    pub x: f64,
    pub y: f64,
    pub frame: usize,
}

/// What the best retained hypothesis decided for one tree this scan.
#[derive(Debug, Clone, Copy)]
pub enum TreeOutcome {
    /// The hypothesis's current tip node for this tree.
    Tip(NodeId),
    /// The tree never existed under this hypothesis.
    Spurious,
}

/// A retained global hypothesis of one cluster.
#[derive(Debug, Clone)]
pub struct GlobalHypothesis {
    pub log_likelihood: f64,
    pub outcomes: BTreeMap<TrackId, TreeOutcome>,
}

/// A cluster after extension: member trees, the reports they competed
/// for, and the retained hypotheses, best first.
#[derive(Debug)]
pub struct Cluster {
    pub trees: Vec<TrackId>,
    pub reports: Vec<ReportId>,
    pub hypotheses: Vec<GlobalHypothesis>,
}

/// State machine over scans.
#[derive(Debug)]
pub struct Scanner {
    model: MotionModel,
    max_depth: usize,
    max_g_hypos: usize,
    min_g_hypo_ratio: f64,
    allow_new_tracks: bool,
    end_scan: usize,
    phase: Phase,
    /// Scans processed so far; the current scan ordinal while scanning.
    time: usize,
    next_track_id: TrackId,
    trees: BTreeMap<TrackId, TrackTree>,
    pools: BTreeMap<usize, ReportPool>,
    clusters: Vec<Cluster>,
    tree_cluster: BTreeMap<TrackId, usize>,
    confirmed: Vec<ConfirmedElement>,
    false_alarms: Vec<FalseAlarm>,
}

impl Scanner {
    pub fn new(params: &TrackerParams) -> Self {
        Self {
            model: MotionModel::new(params),
            max_depth: params.max_depth,
            max_g_hypos: params.max_g_hypos,
            min_g_hypo_ratio: params.min_g_hypo_ratio,
            allow_new_tracks: params.allow_new_tracks,
            end_scan: params.end_scan,
            phase: Phase::FirstScan,
            time: 0,
            next_track_id: 0,
            trees: BTreeMap::new(),
            pools: BTreeMap::new(),
            clusters: Vec::new(),
            tree_cluster: BTreeMap::new(),
            confirmed: Vec::new(),
            false_alarms: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn live_track_count(&self) -> usize {
        self.trees.len()
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Drains the confirmed-element buffer.
    pub fn take_confirmed(&mut self) -> Vec<ConfirmedElement> {
        std::mem::take(&mut self.confirmed)
    }

    /// Drains the false-alarm buffer.
    pub fn take_false_alarms(&mut self) -> Vec<FalseAlarm> {
        std::mem::take(&mut self.false_alarms)
    }

    /// Processes one frame's reports as a full scan.
    pub fn scan(&mut self, frame: usize, reports: Vec<Report>) {
        debug_assert!(
            matches!(self.phase, Phase::FirstScan | Phase::Steady),
            "scan on a drained scanner"
        );
        let scan = self.time;
        self.time += 1;
        debug!(scan, frame, reports = reports.len(), "starting scan");
        self.pools.insert(scan, ReportPool::new(scan, frame, reports));

        if self.phase == Phase::FirstScan {
            self.first_scan(scan);
            self.phase = Phase::Steady;
        } else {
            self.steady_scan(scan, frame);
        }

        self.commit_window(scan);
        self.expire_pools(scan);
        debug!(
            scan,
            tracks = self.trees.len(),
            clusters = self.clusters.len(),
            "scan complete"
        );

        if frame >= self.end_scan {
            self.drain();
        }
    }

    /// Commits everything still in flight and finishes. Idempotent.
    pub fn drain(&mut self) {
        if matches!(self.phase, Phase::Draining | Phase::Done) {
            return;
        }
        self.phase = Phase::Draining;

        let tids: Vec<TrackId> = self.trees.keys().copied().collect();
        for tid in tids {
            match self.best_tip(tid) {
                None => {
                    self.trees.remove(&tid);
                }
                Some(tip) => {
                    let tree = self.trees.remove(&tid).expect("tree is live");
                    for node in tree.path_from_root(tip) {
                        self.emit_node(&tree, tid, node);
                    }
                }
            }
        }

        self.clusters.clear();
        self.tree_cluster.clear();
        let pools = std::mem::take(&mut self.pools);
        for (_, pool) in pools {
            for r in pool.unclaimed() {
                self.false_alarms.push(FalseAlarm { x: r.x, y: r.y, frame: r.frame });
            }
        }
        self.phase = Phase::Done;
        debug!(
            confirmed = self.confirmed.len(),
            false_alarms = self.false_alarms.len(),
            "drained"
        );
    }

    /// First scan: every report roots a new track tree.
    fn first_scan(&mut self, scan: usize) {
        let reports: Vec<(ReportId, Report)> = {
            let pool = &self.pools[&scan];
            pool.ids().map(|id| (id, pool.get(id).clone())).collect()
        };

        let mut clusters = Vec::new();
        let mut tree_cluster = BTreeMap::new();
        for (rid, report) in reports {
            let state = self.model.initial_state(&report);
            let cum = self.model.start_log_likelihood() - report.falarm_log_lik;
            let tid = self.next_track_id;
            self.next_track_id += 1;

            let tree = TrackTree::new(
                tid,
                scan,
                report.frame,
                rid,
                (report.x, report.y),
                state,
                cum,
            );
            let root = tree.root();
            self.trees.insert(tid, tree);

            tree_cluster.insert(tid, clusters.len());
            clusters.push(Cluster {
                trees: vec![tid],
                reports: vec![rid],
                hypotheses: vec![GlobalHypothesis {
                    log_likelihood: cum,
                    outcomes: [(tid, TreeOutcome::Tip(root))].into_iter().collect(),
                }],
            });
        }
        self.clusters = clusters;
        self.tree_cluster = tree_cluster;
    }

    /// Steady-state scan: gate, partition, rank, extend, prune.
    fn steady_scan(&mut self, scan: usize, frame: usize) {
        let model = self.model.clone();
        let pool_reports: Vec<(ReportId, Report)> = self
            .pools
            .get(&scan)
            .map(|p| p.ids().map(|id| (id, p.get(id).clone())).collect())
            .unwrap_or_default();

        // 1. Gating: every live leaf against every new report.
        let mut tree_edges: BTreeMap<TrackId, BTreeSet<ReportId>> = BTreeMap::new();
        let mut tree_options: BTreeMap<TrackId, Vec<ClusterOption>> = BTreeMap::new();
        let mut gating_leaves: BTreeMap<TrackId, Vec<NodeId>> = BTreeMap::new();

        for (&tid, tree) in self.trees.iter_mut() {
            let leaves = tree.leaves();
            gating_leaves.insert(tid, leaves.clone());
            let edges = tree_edges.entry(tid).or_default();
            let opts = tree_options.entry(tid).or_default();

            for leaf in leaves {
                let node = tree.node_mut(leaf);
                if node.ended {
                    opts.push(ClusterOption {
                        kind: OptionKind::Hold { tree: tid, leaf },
                        score: node.cum_log_lik,
                    });
                    continue;
                }

                let cum = node.cum_log_lik;
                let cont = model.log_likelihood_continue(&node.state);
                let end = model.log_likelihood_end(&node.state);

                match model.skip_state(&mut node.state) {
                    Ok(state) => {
                        opts.push(ClusterOption {
                            kind: OptionKind::Skip { tree: tid, leaf, state: Some(state) },
                            score: cum + cont + model.log_likelihood_skip(),
                        });
                        for (rid, report) in &pool_reports {
                            match model.validate(&mut node.state, report) {
                                Ok(Some(state)) => {
                                    let edge = state.log_likelihood();
                                    opts.push(ClusterOption {
                                        kind: OptionKind::Extend {
                                            tree: tid,
                                            leaf,
                                            report: *rid,
                                            measurement: (report.x, report.y),
                                            state: Some(state),
                                        },
                                        score: cum
                                            + cont
                                            + model.log_likelihood_detect()
                                            + edge
                                            - report.falarm_log_lik,
                                    });
                                    edges.insert(*rid);
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    debug!(track = tid, "dropping candidate: {err}");
                                }
                            }
                        }
                    }
                    Err(err) => {
                        debug!(track = tid, "leaf kept end-only after numeric failure: {err}");
                    }
                }

                opts.push(ClusterOption {
                    kind: OptionKind::End { tree: tid, leaf },
                    score: cum + end,
                });
            }

            if tree.committed == 0 {
                opts.push(ClusterOption {
                    kind: OptionKind::Spurious { tree: tid },
                    score: 0.0,
                });
            }
        }

        // 2. Reports may start new tracks when enabled.
        let mut standalone: BTreeSet<ReportId> = BTreeSet::new();
        if self.allow_new_tracks {
            standalone.extend(pool_reports.iter().map(|(rid, _)| *rid));
        }

        // 3-5. Per cluster: rank hypotheses, extend trees, split again
        // next scan by construction.
        let components = partition_components(&tree_edges, &standalone);
        let mut clusters: Vec<Cluster> = Vec::new();
        let mut unsolvable: Vec<TrackId> = Vec::new();

        for (comp_trees, comp_reports) in components {
            let mut options: Vec<ClusterOption> = Vec::new();
            for tid in &comp_trees {
                options.append(&mut tree_options.remove(tid).unwrap_or_default());
            }
            if self.allow_new_tracks {
                for &rid in &comp_reports {
                    let report = &pool_reports[rid.index].1;
                    options.push(ClusterOption {
                        kind: OptionKind::Start {
                            report: rid,
                            measurement: (report.x, report.y),
                            state: Some(model.initial_state(report)),
                        },
                        score: model.start_log_likelihood() - report.falarm_log_lik,
                    });
                }
            }
            if comp_trees.is_empty() && options.is_empty() {
                continue;
            }

            let mut problem = ClusterProblem::new(comp_trees.clone(), comp_reports.clone(), options);
            let Some(retained) = problem.solve(self.max_g_hypos, self.min_g_hypo_ratio) else {
                debug!(trees = ?comp_trees, "cluster unsolvable, ending its tracks");
                unsolvable.extend(comp_trees.iter().copied());
                continue;
            };

            let mut cluster = Cluster {
                trees: comp_trees.clone(),
                reports: comp_reports.clone(),
                hypotheses: Vec::new(),
            };
            // Every option creates at most one child node, shared by
            // all hypotheses that picked it.
            let mut node_of: BTreeMap<usize, (TrackId, NodeId)> = BTreeMap::new();

            for hypo in &retained {
                let mut outcomes: BTreeMap<TrackId, TreeOutcome> = BTreeMap::new();
                for &oi in &hypo.chosen {
                    if let Some(&(tid, node)) = node_of.get(&oi) {
                        outcomes.insert(tid, TreeOutcome::Tip(node));
                        continue;
                    }
                    let score = problem.options[oi].score;
                    match &mut problem.options[oi].kind {
                        OptionKind::Extend { tree, leaf, report, measurement, state } => {
                            let t = self.trees.get_mut(tree).expect("member tree is live");
                            let child = t.add_child(
                                *leaf,
                                Some(*report),
                                Some(*measurement),
                                scan,
                                frame,
                                state.take().expect("extend state consumed once"),
                                score,
                                false,
                            );
                            node_of.insert(oi, (*tree, child));
                            outcomes.insert(*tree, TreeOutcome::Tip(child));
                        }
                        OptionKind::Skip { tree, leaf, state } => {
                            let t = self.trees.get_mut(tree).expect("member tree is live");
                            let child = t.add_child(
                                *leaf,
                                None,
                                None,
                                scan,
                                frame,
                                state.take().expect("skip state consumed once"),
                                score,
                                false,
                            );
                            node_of.insert(oi, (*tree, child));
                            outcomes.insert(*tree, TreeOutcome::Tip(child));
                        }
                        OptionKind::End { tree, leaf } => {
                            let t = self.trees.get_mut(tree).expect("member tree is live");
                            let state = t.node(*leaf).state.clone();
                            let child =
                                t.add_child(*leaf, None, None, scan, frame, state, score, true);
                            node_of.insert(oi, (*tree, child));
                            outcomes.insert(*tree, TreeOutcome::Tip(child));
                        }
                        OptionKind::Hold { tree, leaf } => {
                            node_of.insert(oi, (*tree, *leaf));
                            outcomes.insert(*tree, TreeOutcome::Tip(*leaf));
                        }
                        OptionKind::Spurious { tree } => {
                            outcomes.insert(*tree, TreeOutcome::Spurious);
                        }
                        OptionKind::Start { report, measurement, state } => {
                            let tid = self.next_track_id;
                            self.next_track_id += 1;
                            let tree = TrackTree::new(
                                tid,
                                scan,
                                frame,
                                *report,
                                *measurement,
                                state.take().expect("start state consumed once"),
                                score,
                            );
                            let root = tree.root();
                            self.trees.insert(tid, tree);
                            cluster.trees.push(tid);
                            node_of.insert(oi, (tid, root));
                            outcomes.insert(tid, TreeOutcome::Tip(root));
                        }
                    }
                }
                cluster.hypotheses.push(GlobalHypothesis {
                    log_likelihood: hypo.log_likelihood,
                    outcomes,
                });
            }

            // Leaves no retained hypothesis extended are discarded.
            for tid in &comp_trees {
                let tree = self.trees.get_mut(tid).expect("member tree is live");
                for &leaf in &gating_leaves[tid] {
                    let node = tree.node(leaf);
                    if !node.ended && node.children.is_empty() {
                        tree.prune_leaf(leaf);
                    }
                }
                if tree.is_empty() {
                    debug!(track = tid, "tree lost every hypothesis");
                    self.trees.remove(tid);
                }
            }

            cluster.trees.retain(|tid| self.trees.contains_key(tid));
            cluster.trees.sort_unstable();
            clusters.push(cluster);
        }

        for tid in unsolvable {
            self.flush_tree(tid);
        }

        self.tree_cluster = clusters
            .iter()
            .enumerate()
            .flat_map(|(ci, c)| c.trees.iter().map(move |&t| (t, ci)))
            .collect();
        self.clusters = clusters;
    }

    /// N-scan pruning: once a tree's uncommitted depth exceeds the
    /// window, the root decision is committed along the best retained
    /// hypothesis and the old root's element is emitted.
    fn commit_window(&mut self, scan: usize) {
        let tids: Vec<TrackId> = self.trees.keys().copied().collect();
        for tid in tids {
            loop {
                let Some(tree) = self.trees.get(&tid) else { break };
                if scan < tree.root_scan() + self.max_depth {
                    break;
                }
                match self.best_tip(tid) {
                    None => {
                        debug!(track = tid, "committed as spurious");
                        self.trees.remove(&tid);
                        break;
                    }
                    Some(tip) => {
                        let tree = self.trees.get_mut(&tid).expect("tree is live");
                        let Some(child) = tree.root_child_towards(tip) else {
                            // The held end marker reached the root;
                            // the track's history is fully emitted.
                            self.trees.remove(&tid);
                            break;
                        };
                        let root = tree.root();
                        let (report, measurement, node_frame, node_time, sx, sy, ll, ended) = {
                            let n = tree.node(root);
                            (
                                n.report,
                                n.measurement,
                                n.frame,
                                n.scan,
                                n.state.x(),
                                n.state.y(),
                                n.state.log_likelihood(),
                                n.ended,
                            )
                        };
                        tree.advance_root(child);
                        if !ended {
                            if let Some(rid) = report {
                                if let Some(pool) = self.pools.get_mut(&rid.scan) {
                                    pool.claim(rid);
                                }
                            }
                            self.confirmed.push(ConfirmedElement {
                                track_id: tid,
                                frame: node_frame,
                                time: node_time,
                                measurement,
                                sx,
                                sy,
                                log_likelihood: ll,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Pools older than the window resolve: unclaimed reports become
    /// false alarms.
    fn expire_pools(&mut self, scan: usize) {
        if scan < self.max_depth {
            return;
        }
        let deadline = scan - self.max_depth;
        let expired: Vec<usize> = self
            .pools
            .range(..=deadline)
            .map(|(&s, _)| s)
            .collect();
        for s in expired {
            let pool = self.pools.remove(&s).expect("pool present");
            for r in pool.unclaimed() {
                self.false_alarms.push(FalseAlarm { x: r.x, y: r.y, frame: r.frame });
            }
        }
    }

    /// The best retained hypothesis's tip for a tree, or `None` when
    /// that hypothesis calls the tree spurious.
    fn best_tip(&self, tid: TrackId) -> Option<NodeId> {
        let ci = *self.tree_cluster.get(&tid)?;
        let hypo = self.clusters[ci].hypotheses.first()?;
        match hypo.outcomes.get(&tid) {
            Some(TreeOutcome::Tip(n)) => Some(*n),
            Some(TreeOutcome::Spurious) | None => None,
        }
    }

    /// Forcibly ends a track: commits its best remaining path and
    /// removes the tree.
    fn flush_tree(&mut self, tid: TrackId) {
        let Some(tree) = self.trees.remove(&tid) else { return };
        let mut best: Option<(f64, NodeId)> = None;
        for leaf in tree.leaves() {
            let cum = tree.node(leaf).cum_log_lik;
            if best.map_or(true, |(s, l)| cum > s || (cum == s && leaf < l)) {
                best = Some((cum, leaf));
            }
        }
        if let Some((_, leaf)) = best {
            for node in tree.path_from_root(leaf) {
                self.emit_node(&tree, tid, node);
            }
        }
    }

    fn emit_node(&mut self, tree: &TrackTree, tid: TrackId, node_id: NodeId) {
        let node = tree.node(node_id);
        if node.ended {
            return;
        }
        debug_assert!(node.state.covariance_is_spd(), "live state covariance must be SPD");
        if let Some(rid) = node.report {
            if let Some(pool) = self.pools.get_mut(&rid.scan) {
                pool.claim(rid);
            }
        }
        self.confirmed.push(ConfirmedElement {
            track_id: tid,
            frame: node.frame,
            time: node.scan,
            measurement: node.measurement,
            sx: node.state.x(),
            sy: node.state.y(),
            log_likelihood: node.state.log_likelihood(),
        });
    }
}
