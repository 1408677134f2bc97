use std::time::Duration;

use bytesize::MIB;

use crate::part::part_count;

/// Smallest allowed part, an object-store constraint for all but the final
/// part.
///
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Largest allowed part; keeps individual PUTs boundable.
///
pub const MAX_PART_SIZE: u64 = 100 * MIB;

/// Object-store cap on part numbers.
///
pub const MAX_PARTS: u32 = 10_000;

/// Process-wide cap on simultaneously uploading parts across all jobs.
///
pub const GLOBAL_CONCURRENCY_BUDGET: usize = 8;

/// Bandwidth assumed when no fresh measurement is available.
///
pub const DEFAULT_UPLOAD_BPS: u64 = 4 * MIB;

// A part should take about this long at the effective bandwidth; the safety
// margin under-sizes parts so bandwidth variance does not push an attempt
// into its timeout.
const TARGET_PART_SECS: f64 = 25.0;
const SAFETY_MARGIN: f64 = 0.7;

const MIN_PART_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_PART_TIMEOUT: Duration = Duration::from_secs(300);

/// The work plan for one upload: how to split the file and how hard to push.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    /// Size of every part except possibly the last, in bytes.
    ///
    pub part_size: u64,

    /// Total number of parts.
    ///
    pub num_parts: u32,

    /// How many parts this upload may have in flight at once.
    ///
    pub max_concurrent_parts: usize,

    /// Timeout applied to each part-upload attempt.
    ///
    pub per_part_timeout: Duration,
}

/// Compute the plan for a file of `file_size` bytes.
///
/// `measured_bps` is the last known upload bandwidth, if a fresh measurement
/// exists; `uploads_in_flight` is how many uploads this process is currently
/// running (including the one being planned), used to divide bandwidth and
/// the global concurrency budget fairly.
///
/// Pure function of its inputs.
///
pub fn plan(file_size: u64, measured_bps: Option<u64>, uploads_in_flight: usize) -> PartPlan {
    plan_with_budget(
        file_size,
        measured_bps,
        uploads_in_flight,
        GLOBAL_CONCURRENCY_BUDGET,
    )
}

/// [`plan`] with an explicit process-wide concurrency budget, for callers
/// that let the environment override [`GLOBAL_CONCURRENCY_BUDGET`].
///
pub fn plan_with_budget(
    file_size: u64,
    measured_bps: Option<u64>,
    uploads_in_flight: usize,
    budget: usize,
) -> PartPlan {
    let uploads_in_flight = uploads_in_flight.max(1);
    let effective_bps = (measured_bps.unwrap_or(DEFAULT_UPLOAD_BPS) / uploads_in_flight as u64).max(1);

    let part_size = if file_size <= MIN_PART_SIZE {
        // Too small to split; one part covers the whole file.
        file_size.max(1)
    } else {
        let target = (effective_bps as f64 * TARGET_PART_SECS * SAFETY_MARGIN) as u64;
        // The part-count cap wins over the size ceiling for enormous files.
        let floor = MIN_PART_SIZE.max((file_size + u64::from(MAX_PARTS) - 1) / u64::from(MAX_PARTS));
        target.clamp(floor, MAX_PART_SIZE.max(floor))
    };

    let num_parts = part_count(file_size, part_size);

    let fair_budget = (budget.max(1) / uploads_in_flight).max(1);
    let max_concurrent_parts = concurrency_for(effective_bps)
        .min(fair_budget)
        .min(num_parts as usize)
        .max(1);

    let expected_secs = part_size as f64 / effective_bps as f64;
    let per_part_timeout = Duration::from_secs_f64(
        (expected_secs * 2.0).clamp(MIN_PART_TIMEOUT.as_secs_f64(), MAX_PART_TIMEOUT.as_secs_f64()),
    );

    PartPlan {
        part_size,
        num_parts,
        max_concurrent_parts,
        per_part_timeout,
    }
}

/// Slower networks get fewer simultaneous parts: parallel PUTs on a starved
/// link just starve each other into timeouts.
///
fn concurrency_for(effective_bps: u64) -> usize {
    match effective_bps {
        bps if bps < MIB => 2,
        bps if bps < 4 * MIB => 3,
        bps if bps < 8 * MIB => 4,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_small_file_is_single_part() {
        let plan = plan(3 * MIB, None, 1);
        assert_eq!(plan.num_parts, 1);
        assert_eq!(plan.part_size, 3 * MIB);
        assert_eq!(plan.max_concurrent_parts, 1);
    }

    #[test]
    fn test_empty_file_is_single_part() {
        let plan = plan(0, None, 1);
        assert_eq!(plan.num_parts, 1);
    }

    #[test]
    fn test_slow_network_clamps_to_min_part_size() {
        // 256 KiB/s: 256Ki * 25 * 0.7 ≈ 4.4 MiB, below the 5 MiB floor.
        let plan = plan(12 * MIB, Some(256 * 1024), 1);
        assert_eq!(plan.part_size, MIN_PART_SIZE);
        assert_eq!(plan.num_parts, 3);
    }

    #[test]
    fn test_fast_network_clamps_to_max_part_size() {
        // 10 MiB/s: 10Mi * 25 * 0.7 = 175 MiB, above the 100 MiB ceiling.
        let plan = plan(1024 * MIB, Some(10 * MIB), 1);
        assert_eq!(plan.part_size, MAX_PART_SIZE);
    }

    #[test]
    fn test_part_size_scales_with_bandwidth() {
        let slow = plan(1024 * MIB, Some(MIB), 1);
        let fast = plan(1024 * MIB, Some(4 * MIB), 1);
        assert!(slow.part_size < fast.part_size);
    }

    #[test]
    fn test_part_count_respects_cap() {
        let plan = plan(u64::from(MAX_PARTS) * MIN_PART_SIZE * 2, Some(256 * 1024), 1);
        assert!(plan.num_parts <= MAX_PARTS);
    }

    #[test]
    fn test_concurrency_drops_on_slow_network() {
        let slow = plan(1024 * MIB, Some(512 * 1024), 1);
        let fast = plan(1024 * MIB, Some(16 * MIB), 1);
        assert_eq!(slow.max_concurrent_parts, 2);
        assert_eq!(fast.max_concurrent_parts, 6);
    }

    #[test]
    fn test_budget_divided_across_uploads() {
        let alone = plan(1024 * MIB, Some(16 * MIB), 1);
        let crowded = plan(1024 * MIB, Some(16 * MIB), 4);
        assert_eq!(alone.max_concurrent_parts, 6);
        assert_eq!(crowded.max_concurrent_parts, GLOBAL_CONCURRENCY_BUDGET / 4);
    }

    #[test]
    fn test_explicit_budget_caps_concurrency() {
        let plan = plan_with_budget(1024 * MIB, Some(16 * MIB), 1, 2);
        assert_eq!(plan.max_concurrent_parts, 2);

        // A zero budget still allows one part in flight.
        let plan = plan_with_budget(1024 * MIB, Some(16 * MIB), 1, 0);
        assert_eq!(plan.max_concurrent_parts, 1);
    }

    #[test]
    fn test_timeout_within_bounds() {
        let fast = plan(1024 * MIB, Some(32 * MIB), 1);
        assert_eq!(fast.per_part_timeout, MIN_PART_TIMEOUT);

        // 5 MiB part at 10 KiB/s would take hours; clamped to the ceiling.
        let slow = plan(12 * MIB, Some(10 * 1024), 1);
        assert_eq!(slow.per_part_timeout, MAX_PART_TIMEOUT);
    }

    #[test]
    fn test_bandwidth_divided_across_uploads() {
        // The same network shared by 4 uploads behaves like a slow network.
        let shared = plan(1024 * MIB, Some(4 * MIB), 4);
        let alone = plan(1024 * MIB, Some(4 * MIB), 1);
        assert!(shared.part_size <= alone.part_size);
        assert!(shared.max_concurrent_parts <= alone.max_concurrent_parts);
    }
}
