//! Generalised-assignment solver for global hypothesis ranking.
//!
//! A cluster poses its scan as a sparse list of scored options. Each
//! option may bind a row (a track tree, which must choose exactly one
//! option) and/or a column (a report, which may be consumed at most
//! once). Options with no row are a column's self-options (a report
//! starting a new track); options with no column are a row's no-report
//! continuations (skip, end). An unconsumed column is the zero-score
//! baseline: the report stays available as a false alarm.
//!
//! The best global hypothesis comes from a shortest-augmenting-path
//! minimum-cost matching over the negated scores; the K best come from
//! Murty partitioning over the options of each solution. A brute-force
//! oracle with the same semantics, restricted to small problems, backs
//! the solver in tests.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

/// Sentinel cost for infeasible cells. Real scores are log-likelihoods,
/// many orders of magnitude smaller.
const BIG: f64 = 1e9;

/// One candidate choice in a cluster's assignment problem.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredOption {
    /// Tree slot this option resolves, if any.
    pub row: Option<usize>,
    /// Report slot this option consumes, if any.
    pub col: Option<usize>,
    /// Log-likelihood of choosing this option; higher is better.
    pub score: f64,
}

/// One global hypothesis: a feasible set of options and its total score.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Chosen option indices, ascending.
    pub chosen: Vec<usize>,
    pub score: f64,
}

/// Sums option scores in canonical (ascending index) order so equal
/// hypotheses produce bit-identical totals in every solver.
fn canonical_score(options: &[ScoredOption], chosen: &[usize]) -> f64 {
    chosen.iter().map(|&i| options[i].score).sum()
}

fn rank(a: &Assignment, b: &Assignment) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.chosen.cmp(&b.chosen))
}

/// Returns the single best assignment, or `None` if no feasible
/// assignment exists.
pub fn best_assignment(
    options: &[ScoredOption],
    num_rows: usize,
    num_cols: usize,
) -> Option<Assignment> {
    solve_subproblem(options, num_rows, num_cols, &[], &BTreeSet::new())
}

/// Returns up to `k` best assignments, best first, ties broken by the
/// canonical option order. `None` means the problem is unsolvable.
pub fn k_best_assignments(
    options: &[ScoredOption],
    num_rows: usize,
    num_cols: usize,
    k: usize,
) -> Option<Vec<Assignment>> {
    // Guard against pathological tie plateaus.
    let cap = k.saturating_add(128);

    let first = best_assignment(options, num_rows, num_cols)?;

    let mut heap: BinaryHeap<HeapNode> = BinaryHeap::new();
    heap.push(HeapNode {
        assignment: first,
        forced: Vec::new(),
        forbidden: BTreeSet::new(),
    });

    let mut results: Vec<Assignment> = Vec::new();
    while let Some(node) = heap.pop() {
        // Collect everything at least as good as the k-th result so
        // that boundary ties rank deterministically.
        if results.len() >= k {
            let kth = results[k - 1].score;
            if node.assignment.score != kth || results.len() >= cap {
                break;
            }
        }
        results.push(node.assignment.clone());

        // Murty partition: force a growing prefix of the solution and
        // forbid the next option.
        let free: Vec<usize> = node
            .assignment
            .chosen
            .iter()
            .copied()
            .filter(|o| !node.forced.contains(o))
            .collect();
        let mut forced = node.forced.clone();
        for &opt in &free {
            let mut forbidden = node.forbidden.clone();
            forbidden.insert(opt);
            if let Some(sub) = solve_subproblem(options, num_rows, num_cols, &forced, &forbidden)
            {
                heap.push(HeapNode { assignment: sub, forced: forced.clone(), forbidden });
            }
            forced.push(opt);
        }
    }

    results.sort_by(rank);
    results.truncate(k);
    Some(results)
}

struct HeapNode {
    assignment: Assignment,
    forced: Vec<usize>,
    forbidden: BTreeSet<usize>,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert the ranking so the best
        // (highest score, then smallest canonical key) pops first.
        rank(&other.assignment, &self.assignment)
            .then_with(|| other.forbidden.cmp(&self.forbidden))
    }
}

/// Solves one Murty subproblem: `forced` options are locked in,
/// `forbidden` options are unavailable.
fn solve_subproblem(
    options: &[ScoredOption],
    num_rows: usize,
    num_cols: usize,
    forced: &[usize],
    forbidden: &BTreeSet<usize>,
) -> Option<Assignment> {
    let mut row_resolved = vec![false; num_rows];
    let mut col_resolved = vec![false; num_cols];
    for &f in forced {
        if let Some(r) = options[f].row {
            row_resolved[r] = true;
        }
        if let Some(c) = options[f].col {
            col_resolved[c] = true;
        }
    }

    let act_rows: Vec<usize> = (0..num_rows).filter(|&r| !row_resolved[r]).collect();
    let act_cols: Vec<usize> = (0..num_cols).filter(|&c| !col_resolved[c]).collect();
    let mut row_pos = vec![usize::MAX; num_rows];
    for (i, &r) in act_rows.iter().enumerate() {
        row_pos[r] = i;
    }
    let mut col_pos = vec![usize::MAX; num_cols];
    for (i, &c) in act_cols.iter().enumerate() {
        col_pos[c] = i;
    }

    let nr = act_rows.len();
    let nc = act_cols.len();
    if nr + nc == 0 {
        let mut chosen = forced.to_vec();
        chosen.sort_unstable();
        let score = canonical_score(options, &chosen);
        return Some(Assignment { chosen, score });
    }

    // Matrix rows: active trees, then active reports (self rows).
    // Matrix cols: active reports, then one no-report column per tree,
    // then one slack column per report.
    let n = nr + nc;
    let m = nc + nr + nc;
    let mut cost = vec![vec![BIG; m]; n];
    let mut cell_opt = vec![vec![usize::MAX; m]; n];

    let mut put = |i: usize, j: usize, idx: usize, score: f64, cost: &mut Vec<Vec<f64>>,
                   cell_opt: &mut Vec<Vec<usize>>| {
        if -score < cost[i][j] {
            cost[i][j] = -score;
            cell_opt[i][j] = idx;
        }
    };

    for (idx, opt) in options.iter().enumerate() {
        if forbidden.contains(&idx) {
            continue;
        }
        match (opt.row, opt.col) {
            (Some(r), Some(c)) => {
                if row_pos[r] != usize::MAX && col_pos[c] != usize::MAX {
                    put(row_pos[r], col_pos[c], idx, opt.score, &mut cost, &mut cell_opt);
                }
            }
            (Some(r), None) => {
                if row_pos[r] != usize::MAX {
                    let i = row_pos[r];
                    put(i, nc + i, idx, opt.score, &mut cost, &mut cell_opt);
                }
            }
            (None, Some(c)) => {
                if col_pos[c] != usize::MAX {
                    let i = col_pos[c];
                    put(nr + i, i, idx, opt.score, &mut cost, &mut cell_opt);
                }
            }
            (None, None) => {}
        }
    }

    // Every report's self row can fall back to its slack column: the
    // report is consumed by a tree or stays unclaimed at zero score.
    for ci in 0..nc {
        cost[nr + ci][nc + nr + ci] = 0.0;
    }

    let (row_to_col, total) = lap_min_cost(&cost);
    if total >= BIG / 2.0 {
        return None;
    }

    let mut chosen = forced.to_vec();
    for (i, &j) in row_to_col.iter().enumerate() {
        let opt = cell_opt[i][j];
        if opt != usize::MAX {
            chosen.push(opt);
        }
    }
    chosen.sort_unstable();
    let score = canonical_score(options, &chosen);
    Some(Assignment { chosen, score })
}

/// Rectangular minimum-cost assignment via shortest augmenting paths
/// (Jonker-Volgenant style). Every row gets a column; `cost` must be
/// finite. Returns the column of each row and the total cost.
fn lap_min_cost(cost: &[Vec<f64>]) -> (Vec<usize>, f64) {
    let n = cost.len();
    let m = cost[0].len();
    debug_assert!(n <= m);

    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; m + 1];
    let mut matched = vec![0usize; m + 1]; // row matched to col j, 1-based; 0 = free
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        matched[0] = i;
        let mut j0 = 0usize;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = matched[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;
            for j in 1..=m {
                if !used[j] {
                    let cur = cost[i0 - 1][j - 1] - u[i0] - v[j];
                    if cur < minv[j] {
                        minv[j] = cur;
                        way[j] = j0;
                    }
                    if minv[j] < delta {
                        delta = minv[j];
                        j1 = j;
                    }
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[matched[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if matched[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            matched[j0] = matched[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut row_to_col = vec![usize::MAX; n];
    let mut total = 0.0;
    for j in 1..=m {
        if matched[j] != 0 {
            row_to_col[matched[j] - 1] = j - 1;
            total += cost[matched[j] - 1][j - 1];
        }
    }
    debug_assert!(row_to_col.iter().all(|&c| c != usize::MAX));
    (row_to_col, total)
}

/// Exhaustive oracle with identical semantics and tie-breaking,
/// restricted to small problems. Only meant to back the solver in
/// tests.
pub fn brute_force_assignments(
    options: &[ScoredOption],
    num_rows: usize,
    num_cols: usize,
    k: usize,
) -> Option<Vec<Assignment>> {
    assert!(
        options.len() <= 64 && num_rows + num_cols <= 16,
        "brute-force assignment is restricted to small problems"
    );

    let mut all: Vec<Assignment> = Vec::new();
    let mut chosen: Vec<usize> = Vec::new();
    let mut col_used = vec![false; num_cols];
    search(options, num_rows, num_cols, 0, &mut chosen, &mut col_used, &mut all);

    if all.is_empty() {
        return None;
    }
    all.sort_by(rank);
    all.truncate(k);
    Some(all)
}

fn search(
    options: &[ScoredOption],
    num_rows: usize,
    num_cols: usize,
    level: usize,
    chosen: &mut Vec<usize>,
    col_used: &mut Vec<bool>,
    all: &mut Vec<Assignment>,
) {
    if level < num_rows {
        // This tree must pick exactly one of its options.
        let row = level;
        for (idx, opt) in options.iter().enumerate() {
            if opt.row != Some(row) {
                continue;
            }
            if let Some(c) = opt.col {
                if col_used[c] {
                    continue;
                }
                col_used[c] = true;
            }
            chosen.push(idx);
            search(options, num_rows, num_cols, level + 1, chosen, col_used, all);
            chosen.pop();
            if let Some(c) = opt.col {
                col_used[c] = false;
            }
        }
    } else if level < num_rows + num_cols {
        // This report is already consumed, stays unclaimed, or takes
        // one of its self-options.
        let col = level - num_rows;
        search(options, num_rows, num_cols, level + 1, chosen, col_used, all);
        if !col_used[col] {
            for (idx, opt) in options.iter().enumerate() {
                if opt.row.is_none() && opt.col == Some(col) {
                    col_used[col] = true;
                    chosen.push(idx);
                    search(options, num_rows, num_cols, level + 1, chosen, col_used, all);
                    chosen.pop();
                    col_used[col] = false;
                }
            }
        }
    } else {
        let mut set = chosen.clone();
        set.sort_unstable();
        let score = canonical_score(options, &set);
        all.push(Assignment { chosen: set, score });
    }
}
