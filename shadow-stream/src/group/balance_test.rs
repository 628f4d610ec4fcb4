use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::error::AppError;
use crate::group::balance::{BalanceStrategy, CoPartitionedStrategy, RangeStrategy};

fn members(count: usize) -> Vec<String> {
    (0..count).map(|idx| format!("member-{}", idx)).collect()
}

fn topics(counts: &[(&str, u32)]) -> BTreeMap<String, u32> {
    counts.iter().map(|(name, count)| (name.to_string(), *count)).collect()
}

#[test]
fn co_partitioned_rejects_mismatched_partition_counts() -> Result<()> {
    let err = CoPartitionedStrategy
        .plan(&members(2), &topics(&[("reported", 4), ("desired", 3)]))
        .expect_err("expected mismatched partition counts to be rejected");

    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(matches!(app_err, AppError::InvalidInput(_)), "unexpected error: {:?}", app_err);
    Ok(())
}

#[test]
fn co_partitioned_assigns_same_index_to_same_member() -> Result<()> {
    for partitions in 1..=9u32 {
        for member_count in 1..=4usize {
            let members = members(member_count);
            let plan = CoPartitionedStrategy.plan(&members, &topics(&[("reported", partitions), ("desired", partitions)]))?;

            let (floor, ceil) = (partitions as usize / member_count, (partitions as usize + member_count - 1) / member_count);
            let mut owners = BTreeMap::new();
            for member in members.iter() {
                let assignment = plan.get(member).context("expected every member in the plan")?;
                let reported = assignment.get("reported").cloned().unwrap_or_default();
                let desired = assignment.get("desired").cloned().unwrap_or_default();
                assert_eq!(reported, desired, "expected identical partitions across co-partitioned topics");
                assert!(
                    reported.len() == floor || reported.len() == ceil,
                    "member {} received {} partitions, expected {} or {} ({} partitions, {} members)",
                    member,
                    reported.len(),
                    floor,
                    ceil,
                    partitions,
                    member_count
                );
                for partition in reported {
                    assert!(owners.insert(partition, member.clone()).is_none(), "partition {} assigned twice", partition);
                }
            }
            assert_eq!(owners.len(), partitions as usize, "expected every partition to be assigned");
        }
    }
    Ok(())
}

#[test]
fn co_partitioned_with_no_members_is_empty() -> Result<()> {
    let plan = CoPartitionedStrategy.plan(&[], &topics(&[("a", 2), ("b", 2)]))?;
    assert!(plan.is_empty());
    Ok(())
}

#[test]
fn range_assigns_contiguous_ranges() -> Result<()> {
    let members = members(3);
    let plan = RangeStrategy.plan(&members, &topics(&[("deltas", 7)]))?;

    assert_eq!(plan["member-0"]["deltas"], vec![0, 1, 2]);
    assert_eq!(plan["member-1"]["deltas"], vec![3, 4]);
    assert_eq!(plan["member-2"]["deltas"], vec![5, 6]);
    Ok(())
}

#[test]
fn range_leaves_surplus_members_empty() -> Result<()> {
    let members = members(3);
    let plan = RangeStrategy.plan(&members, &topics(&[("deltas", 2)]))?;

    assert_eq!(plan["member-0"]["deltas"], vec![0]);
    assert_eq!(plan["member-1"]["deltas"], vec![1]);
    assert!(plan["member-2"].is_empty(), "expected the surplus member to receive nothing");
    Ok(())
}
