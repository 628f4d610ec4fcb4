//! Consumer group balance strategies.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::error::AppError;

/// A partition assignment plan: member ID -> topic -> assigned partitions.
pub type Plan = BTreeMap<String, BTreeMap<String, Vec<u32>>>;

/// A strategy used to assign topic partitions to the members of a consumer group.
pub trait BalanceStrategy: Send + Sync + 'static {
    /// The name of this strategy.
    fn name(&self) -> &'static str;

    /// Compute the assignment plan for the given sorted member IDs & topic partition counts.
    ///
    /// Every member is present in the returned plan, even when it is assigned nothing.
    fn plan(&self, members: &[String], topics: &BTreeMap<String, u32>) -> Result<Plan>;
}

/// A strategy assigning the same partition index of every topic to the same member.
///
/// All topics must have the same number of partitions. Partition `i` is assigned to member
/// `i % members`, so every member receives either the floor or the ceiling of the even share.
pub struct CoPartitionedStrategy;

impl BalanceStrategy for CoPartitionedStrategy {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn plan(&self, members: &[String], topics: &BTreeMap<String, u32>) -> Result<Plan> {
        let mut counts = topics.values().copied();
        let partitions = counts.next().unwrap_or(0);
        if counts.any(|count| count != partitions) {
            bail!(AppError::InvalidInput(format!(
                "topics {:?} must have identical partition counts to be co-partitioned",
                topics.keys().collect::<Vec<_>>()
            )));
        }

        let mut plan = empty_plan(members);
        if members.is_empty() {
            return Ok(plan);
        }
        for partition in 0..partitions {
            let member = &members[partition as usize % members.len()];
            if let Some(assignment) = plan.get_mut(member) {
                for topic in topics.keys() {
                    assignment.entry(topic.clone()).or_default().push(partition);
                }
            }
        }
        Ok(plan)
    }
}

/// A strategy assigning each member a contiguous range of the partitions of each topic.
pub struct RangeStrategy;

impl BalanceStrategy for RangeStrategy {
    fn name(&self) -> &'static str {
        "range"
    }

    fn plan(&self, members: &[String], topics: &BTreeMap<String, u32>) -> Result<Plan> {
        let mut plan = empty_plan(members);
        if members.is_empty() {
            return Ok(plan);
        }
        let count = members.len() as u32;
        for (topic, partitions) in topics {
            let (share, extra) = (partitions / count, partitions % count);
            let mut next = 0;
            for (idx, member) in members.iter().enumerate() {
                let len = share + if (idx as u32) < extra { 1 } else { 0 };
                if len == 0 {
                    continue;
                }
                if let Some(assignment) = plan.get_mut(member) {
                    assignment.insert(topic.clone(), (next..next + len).collect());
                }
                next += len;
            }
        }
        Ok(plan)
    }
}

fn empty_plan(members: &[String]) -> Plan {
    members.iter().map(|member| (member.clone(), BTreeMap::new())).collect()
}
