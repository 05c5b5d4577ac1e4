use std::fmt;

use chrono::{DateTime, Utc};

use crate::mesh::Rank;

/// An evaluated point as the coordinator records it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvaluationResult {
    pub x: f64,
    pub f: f64,
    pub ok: bool,
    /// Rank of the worker that evaluated the point.
    pub worker: Rank,
}

/// Everything the coordinator collected, in arrival order.
#[derive(Clone, Debug)]
pub struct Report {
    pub results: Vec<EvaluationResult>,
    pub workers: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Report {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.ok).count()
    }

    /// Results evaluated by `worker`.
    pub fn by_worker(&self, worker: Rank) -> impl Iterator<Item = &EvaluationResult> {
        self.results.iter().filter(move |r| r.worker == worker)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary of {} evalpoints:", self.results.len())?;
        writeln!(f, "X\tF\tProcess")?;
        for result in &self.results {
            writeln!(f, "{}\t{}\t{}", result.x, result.f, result.worker)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(results: Vec<EvaluationResult>) -> Report {
        let now = Utc::now();
        Report {
            results,
            workers: 2,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn table_lists_results_in_order() {
        let report = report(vec![
            EvaluationResult {
                x: 2.5,
                f: 2.0,
                ok: true,
                worker: 2,
            },
            EvaluationResult {
                x: 1.5,
                f: 1.0,
                ok: true,
                worker: 1,
            },
        ]);
        assert_eq!(
            report.to_string(),
            "Summary of 2 evalpoints:\nX\tF\tProcess\n2.5\t2\t2\n1.5\t1\t1\n"
        );
    }

    #[test]
    fn counts_failures_and_filters_by_worker() {
        let report = report(vec![
            EvaluationResult {
                x: 1.0,
                f: f64::NAN,
                ok: false,
                worker: 1,
            },
            EvaluationResult {
                x: 2.0,
                f: 2.0,
                ok: true,
                worker: 2,
            },
        ]);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.by_worker(2).count(), 1);
        assert!(!report.is_empty());
    }
}
