//! How a parent resolves once every child is terminal.

use std::str::FromStr;

use crate::jobs::{ChildJobStats, JobStatus};

/// Rule deciding whether settled children make the parent fail.
///
/// A parent whose children were all cancelled always resolves to
/// cancelled, whatever the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum FailurePolicy {
    /// Any failed child fails the parent.
    #[default]
    AnyFailed,
    /// Fail only when every child failed.
    AllFailed,
    /// Fail when no child completed.
    NoneSucceeded,
    /// Fail when at least this share of children failed (0.0-1.0).
    FailedRatio(f64),
}

impl FailurePolicy {
    /// Final status for a settled set of children.
    pub fn resolve(&self, stats: &ChildJobStats) -> JobStatus {
        if stats.total > 0 && stats.cancelled == stats.total {
            return JobStatus::Cancelled;
        }
        if self.is_failure(stats) {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }

    fn is_failure(&self, stats: &ChildJobStats) -> bool {
        if stats.total == 0 {
            return false;
        }
        match *self {
            Self::AnyFailed => stats.failed > 0,
            Self::AllFailed => stats.failed == stats.total,
            Self::NoneSucceeded => stats.completed == 0,
            Self::FailedRatio(ratio) => {
                stats.failed > 0 && stats.failed as f64 / stats.total as f64 >= ratio
            }
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnyFailed => f.write_str("any_failed"),
            Self::AllFailed => f.write_str("all_failed"),
            Self::NoneSucceeded => f.write_str("none_succeeded"),
            Self::FailedRatio(r) => write!(f, "failed_ratio:{r}"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    /// Accepts `any_failed`, `all_failed`, `none_succeeded`, or
    /// `failed_ratio:<0.0-1.0>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "any_failed" => Ok(Self::AnyFailed),
            "all_failed" => Ok(Self::AllFailed),
            "none_succeeded" => Ok(Self::NoneSucceeded),
            other => {
                let ratio = other
                    .strip_prefix("failed_ratio:")
                    .ok_or_else(|| format!("unknown failure policy: {other}"))?;
                let ratio: f64 = ratio
                    .parse()
                    .map_err(|_| format!("invalid failure ratio: {ratio}"))?;
                if !(ratio > 0.0 && ratio <= 1.0) {
                    return Err(format!("failure ratio must be in (0, 1]: {ratio}"));
                }
                Ok(Self::FailedRatio(ratio))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(completed: usize, failed: usize, cancelled: usize) -> ChildJobStats {
        let mut stats = ChildJobStats::default();
        (0..completed).for_each(|_| stats.record(JobStatus::Completed));
        (0..failed).for_each(|_| stats.record(JobStatus::Failed));
        (0..cancelled).for_each(|_| stats.record(JobStatus::Cancelled));
        stats
    }

    #[test]
    fn all_failed_tolerates_partial_failure() {
        let policy = FailurePolicy::AllFailed;
        assert_eq!(policy.resolve(&stats(3, 2, 0)), JobStatus::Completed);
        assert_eq!(policy.resolve(&stats(0, 3, 0)), JobStatus::Failed);
    }

    #[test]
    fn any_failed_is_strict() {
        assert_eq!(FailurePolicy::AnyFailed.resolve(&stats(4, 1, 0)), JobStatus::Failed);
        assert_eq!(FailurePolicy::AnyFailed.resolve(&stats(4, 0, 1)), JobStatus::Completed);
    }

    #[test]
    fn none_succeeded_counts_cancellations_against() {
        assert_eq!(FailurePolicy::NoneSucceeded.resolve(&stats(0, 1, 2)), JobStatus::Failed);
        assert_eq!(FailurePolicy::NoneSucceeded.resolve(&stats(1, 5, 0)), JobStatus::Completed);
    }

    #[test]
    fn ratio_threshold_is_inclusive() {
        let policy = FailurePolicy::FailedRatio(0.5);
        assert_eq!(policy.resolve(&stats(2, 2, 0)), JobStatus::Failed);
        assert_eq!(policy.resolve(&stats(3, 2, 0)), JobStatus::Completed);
    }

    #[test]
    fn all_cancelled_wins_over_policy() {
        for policy in [
            FailurePolicy::AnyFailed,
            FailurePolicy::AllFailed,
            FailurePolicy::NoneSucceeded,
        ] {
            assert_eq!(policy.resolve(&stats(0, 0, 3)), JobStatus::Cancelled);
        }
    }

    #[test]
    fn parses_from_config_strings() {
        assert_eq!("all_failed".parse::<FailurePolicy>().unwrap(), FailurePolicy::AllFailed);
        assert_eq!(
            "failed_ratio:0.25".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::FailedRatio(0.25)
        );
        assert!("failed_ratio:2".parse::<FailurePolicy>().is_err());
        assert!("sometimes".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::FailedRatio(0.25).to_string(), "failed_ratio:0.25");
    }
}
