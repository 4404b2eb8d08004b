//! Corner reports and per-scan report pools.

use serde::{Deserialize, Serialize};

use crate::linalg::Vector2;
use crate::patch::Patch;

/// Stable handle of a report: the scan ordinal it arrived in plus its
/// index within that scan's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReportId {
    pub scan: usize,
    pub index: usize,
}

/// A single corner observation from one frame. Immutable after
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Frame label from the input stream.
    pub frame: usize,
    pub x: f64,
    pub y: f64,
    pub patch: Patch,
    /// Log-likelihood of this report being a false alarm, fixed at
    /// ingest time.
    pub falarm_log_lik: f64,
}

impl Report {
    /// Measurement vector (x, y).
    pub fn z(&self) -> Vector2 {
        Vector2::new(self.x, self.y)
    }
}

/// The reports of one scan, owned by the scanner until the scan passes
/// out of the N-scan window.
#[derive(Debug)]
pub struct ReportPool {
    scan: usize,
    frame: usize,
    reports: Vec<Report>,
    claimed: Vec<bool>,
}

impl ReportPool {
    pub fn new(scan: usize, frame: usize, reports: Vec<Report>) -> Self {
        let claimed = vec![false; reports.len()];
        Self { scan, frame, reports, claimed }
    }

    pub fn scan(&self) -> usize {
        self.scan
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn get(&self, id: ReportId) -> &Report {
        debug_assert_eq!(id.scan, self.scan);
        &self.reports[id.index]
    }

    pub fn ids(&self) -> impl Iterator<Item = ReportId> + '_ {
        let scan = self.scan;
        (0..self.reports.len()).map(move |index| ReportId { scan, index })
    }

    /// Marks a report as belonging to some committed track history.
    pub fn claim(&mut self, id: ReportId) {
        debug_assert_eq!(id.scan, self.scan);
        self.claimed[id.index] = true;
    }

    /// Reports no committed hypothesis ever claimed, in pool order.
    pub fn unclaimed(&self) -> impl Iterator<Item = &Report> + '_ {
        self.reports
            .iter()
            .zip(self.claimed.iter())
            .filter(|(_, claimed)| !**claimed)
            .map(|(report, _)| report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(frame: usize, x: f64) -> Report {
        Report {
            frame,
            x,
            y: 0.0,
            patch: Patch::flat(10),
            falarm_log_lik: -3.0,
        }
    }

    #[test]
    fn pool_claims_track_reports() {
        let mut pool = ReportPool::new(2, 7, vec![report(7, 1.0), report(7, 2.0)]);
        assert_eq!(pool.len(), 2);

        let ids: Vec<ReportId> = pool.ids().collect();
        assert_eq!(ids[0], ReportId { scan: 2, index: 0 });

        pool.claim(ids[0]);
        let left: Vec<f64> = pool.unclaimed().map(|r| r.x).collect();
        assert_eq!(left, vec![2.0]);
    }
}
