//! Preemptable job classification and victim selection.
//!
//! An operation's running jobs are ordered by start time. The oldest
//! `max_unpreemptable_running_job_count` jobs are never preempted. Past
//! that prefix, jobs are classified by the operation's cumulative usage
//! when the job is counted:
//!
//! ```text
//!   usage ≤ fair · aggressive_threshold   non-preemptable
//!   usage ≤ fair · threshold              aggressively preemptable
//!   beyond                                preemptable
//! ```

use tessera_core::{approx_le, JobId, Millis, ResourceVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPreemptionStatus {
    NonPreemptable,
    AggressivelyPreemptable,
    Preemptable,
}

impl JobPreemptionStatus {
    /// May be taken by a preemptor of the given aggressiveness.
    pub fn allows(self, aggressive: bool) -> bool {
        match self {
            JobPreemptionStatus::Preemptable => true,
            JobPreemptionStatus::AggressivelyPreemptable => aggressive,
            JobPreemptionStatus::NonPreemptable => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreemptionThresholds {
    pub max_unpreemptable_running_job_count: usize,
    pub satisfaction_threshold: f64,
    pub aggressive_satisfaction_threshold: f64,
}

pub struct RunningJob<'a> {
    pub id: JobId,
    pub started_at: Millis,
    pub resources: &'a ResourceVector,
}

/// Classify the running jobs of one operation against its fair share.
pub fn classify_jobs(
    jobs: &[RunningJob<'_>],
    fair_share: &ResourceVector,
    total: &ResourceVector,
    thresholds: &PreemptionThresholds,
) -> Vec<(JobId, JobPreemptionStatus)> {
    let mut order: Vec<&RunningJob<'_>> = jobs.iter().collect();
    order.sort_by_key(|j| (j.started_at, j.id));

    let fair = fair_share.dominant(total);
    let mut usage = ResourceVector::zero();
    order
        .into_iter()
        .enumerate()
        .map(|(position, job)| {
            usage += job.resources;
            let status = if position < thresholds.max_unpreemptable_running_job_count {
                JobPreemptionStatus::NonPreemptable
            } else {
                let ratio = usage.dominant(total);
                if approx_le(ratio, fair * thresholds.aggressive_satisfaction_threshold) {
                    JobPreemptionStatus::NonPreemptable
                } else if approx_le(ratio, fair * thresholds.satisfaction_threshold) {
                    JobPreemptionStatus::AggressivelyPreemptable
                } else {
                    JobPreemptionStatus::Preemptable
                }
            };
            (job.id, status)
        })
        .collect()
}

/// A job that may be taken, with the satisfaction of its operation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub job: JobId,
    pub started_at: Millis,
    pub resources: ResourceVector,
    pub satisfaction: f64,
}

/// Pick candidates until `free` plus what they release covers `needed`.
///
/// Candidates are taken in increasing satisfaction of their operation,
/// youngest job first among equals. Returns nothing if all of them
/// together are not enough.
pub fn select_victims(mut candidates: Vec<Candidate>, free: &ResourceVector, needed: &ResourceVector) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        a.satisfaction
            .total_cmp(&b.satisfaction)
            .then(b.started_at.cmp(&a.started_at))
    });
    let mut available = free.clone();
    let mut victims = Vec::new();
    for candidate in candidates {
        if needed.fits(&available) {
            break;
        }
        available += &candidate.resources;
        victims.push(candidate);
    }
    if needed.fits(&available) { victims } else { Vec::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(prefix: usize) -> PreemptionThresholds {
        PreemptionThresholds {
            max_unpreemptable_running_job_count: prefix,
            satisfaction_threshold: 1.0,
            aggressive_satisfaction_threshold: 0.5,
        }
    }

    #[test]
    fn jobs_are_classified_by_cumulative_usage() {
        let cpu = ResourceVector::cpu(1.0);
        let ids: Vec<JobId> = (0..10).map(|_| JobId::new()).collect();
        let jobs: Vec<RunningJob<'_>> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| RunningJob {
                id: *id,
                started_at: i as Millis,
                resources: &cpu,
            })
            .collect();
        let total = ResourceVector::cpu(10.0);
        let classes = classify_jobs(&jobs, &ResourceVector::cpu(4.0), &total, &thresholds(0));
        let statuses: Vec<JobPreemptionStatus> = classes.iter().map(|(_, s)| *s).collect();
        use JobPreemptionStatus::*;
        assert_eq!(
            statuses,
            vec![
                NonPreemptable,
                NonPreemptable,
                AggressivelyPreemptable,
                AggressivelyPreemptable,
                Preemptable,
                Preemptable,
                Preemptable,
                Preemptable,
                Preemptable,
                Preemptable,
            ]
        );

        let protected = classify_jobs(&jobs, &ResourceVector::zero(), &total, &thresholds(3));
        assert!(protected[..3].iter().all(|(_, s)| *s == NonPreemptable));
        assert!(protected[3..].iter().all(|(_, s)| *s == Preemptable));
    }

    #[test]
    fn victims_cover_the_gap_or_nothing() {
        let candidate = |satisfaction: f64, started_at: Millis| Candidate {
            job: JobId::new(),
            started_at,
            resources: ResourceVector::cpu(1.0),
            satisfaction,
        };
        let needed = ResourceVector::cpu(2.0);
        let victims = select_victims(
            vec![candidate(3.0, 1), candidate(2.0, 1), candidate(2.0, 5)],
            &ResourceVector::zero(),
            &needed,
        );
        assert_eq!(victims.len(), 2);
        assert_eq!(victims[0].satisfaction, 2.0);
        assert_eq!(victims[0].started_at, 5);
        assert_eq!(victims[1].started_at, 1);

        let short = select_victims(vec![candidate(2.0, 1)], &ResourceVector::zero(), &needed);
        assert!(short.is_empty());
        let already_free = select_victims(vec![candidate(2.0, 1)], &ResourceVector::cpu(2.0), &needed);
        assert!(already_free.is_empty());
    }
}
