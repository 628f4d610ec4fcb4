//! Consumer group runtime.
//!
//! Members join a group through the in-process `Coordinator`. Every join or leave starts a new
//! generation, which ends the current session of every member. A session computes the partition
//! plan with the group's `BalanceStrategy`, takes the ownership lock of every assigned partition,
//! and then drives one `ClaimWorker` per assigned partition index in its own task until the
//! generation changes or shutdown is requested.

pub mod balance;
#[cfg(test)]
mod balance_test;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::models::stream::Record;
use crate::stream::Broker;
pub use balance::{BalanceStrategy, CoPartitionedStrategy, RangeStrategy};

/// The delay before a failed session is retried.
const SESSION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A type which prepares a worker for each partition index assigned to this member.
#[async_trait]
pub trait GroupHandler: Send + Sync + 'static {
    /// The worker driving a single claim.
    type Worker: ClaimWorker;

    /// Prepare a worker for the given partition index.
    ///
    /// This is where per-partition state is recovered. No records of the partition are delivered
    /// until this returns, and an error aborts the whole session.
    async fn setup(&self, session: &GroupSession, partition: u32) -> Result<Self::Worker>;
}

/// A worker consuming the records of a single claim.
#[async_trait]
pub trait ClaimWorker: Send + 'static {
    /// Consume the claim until it is revoked, returning `Ok` once `Claim::next_batch` yields `None`.
    async fn consume_claim(&mut self, session: &GroupSession, claim: &mut Claim) -> Result<()>;

    /// Release any resources held by this worker, called once the claim has been revoked.
    async fn cleanup(&mut self, session: &GroupSession) -> Result<()>;
}

/// The in-process registry of consumer groups & their members.
#[derive(Clone, Default)]
pub struct Coordinator {
    groups: Arc<Mutex<HashMap<String, GroupState>>>,
}

struct GroupState {
    members: BTreeSet<String>,
    generation: watch::Sender<u64>,
    generation_rx: watch::Receiver<u64>,
    /// Partition ownership locks, by topic & partition.
    locks: HashMap<(String, u32), Arc<tokio::sync::Mutex<()>>>,
}

impl GroupState {
    fn new() -> Self {
        let (generation, generation_rx) = watch::channel(0);
        Self {
            members: BTreeSet::new(),
            generation,
            generation_rx,
            locks: HashMap::new(),
        }
    }

    fn bump_generation(&mut self) {
        let next = *self.generation_rx.borrow() + 1;
        let _ = self.generation.send(next);
    }
}

impl Coordinator {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_groups(&self) -> MutexGuard<'_, HashMap<String, GroupState>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a member to a group, starting a new generation if it was not yet a member.
    pub fn join(&self, group: &str, member: &str) {
        let mut groups = self.lock_groups();
        let state = groups.entry(group.to_string()).or_insert_with(GroupState::new);
        if state.members.insert(member.to_string()) {
            state.bump_generation();
            tracing::debug!(group, member, generation = *state.generation_rx.borrow(), "member joined group");
        }
    }

    /// Remove a member from a group, starting a new generation if it was a member.
    pub fn leave(&self, group: &str, member: &str) {
        let mut groups = self.lock_groups();
        if let Some(state) = groups.get_mut(group) {
            if state.members.remove(member) {
                state.bump_generation();
                tracing::debug!(group, member, generation = *state.generation_rx.borrow(), "member left group");
            }
        }
    }

    /// The current generation, sorted members & a generation change receiver of a group.
    fn snapshot(&self, group: &str) -> (u64, Vec<String>, watch::Receiver<u64>) {
        let mut groups = self.lock_groups();
        let state = groups.entry(group.to_string()).or_insert_with(GroupState::new);
        let mut rx = state.generation_rx.clone();
        let generation = *rx.borrow_and_update();
        (generation, state.members.iter().cloned().collect(), rx)
    }

    fn partition_lock(&self, group: &str, topic: &str, partition: u32) -> Arc<tokio::sync::Mutex<()>> {
        let mut groups = self.lock_groups();
        let state = groups.entry(group.to_string()).or_insert_with(GroupState::new);
        state.locks.entry((topic.to_string(), partition)).or_default().clone()
    }
}

/// The context of a single generation of a group member.
#[derive(Clone)]
pub struct GroupSession {
    broker: Broker,
    group: Arc<String>,
    member: Arc<String>,
    generation: u64,
}

impl GroupSession {
    /// The node's topic log.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// The name of the consumer group.
    pub fn group(&self) -> &str {
        self.group.as_str()
    }

    /// The ID of this member.
    pub fn member(&self) -> &str {
        self.member.as_str()
    }

    /// The generation of this session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// This session over another topic log.
    #[cfg(test)]
    pub(crate) fn with_broker(&self, broker: Broker) -> Self {
        Self { broker, ..self.clone() }
    }

    /// Mark the given record, and everything before it on its partition, as consumed.
    pub async fn commit(&self, record: &ClaimRecord) -> Result<()> {
        self.broker
            .commit_offset(&self.group, &record.topic, record.partition, record.record.offset + 1)
            .await
    }

    /// Mark every record of the given batch as consumed.
    pub async fn commit_batch(&self, batch: &[ClaimRecord]) -> Result<()> {
        let mut next_offsets: BTreeMap<(&str, u32), u64> = BTreeMap::new();
        for rec in batch {
            let next = next_offsets.entry((rec.topic.as_str(), rec.partition)).or_insert(0);
            *next = (*next).max(rec.record.offset + 1);
        }
        for ((topic, partition), next_offset) in next_offsets {
            self.broker.commit_offset(&self.group, topic, partition, next_offset).await?;
        }
        Ok(())
    }
}

/// A record delivered through a claim.
#[derive(Clone, Debug)]
pub struct ClaimRecord {
    /// The topic the record was read from.
    pub topic: Arc<String>,
    pub partition: u32,
    pub record: Record,
}

/// One partition index of every topic of a session, owned by a single worker.
pub struct Claim {
    broker: Broker,
    partition: u32,
    topics: Vec<ClaimTopic>,
    /// Index of the topic read first on the next fetch, rotated for fairness.
    cursor: usize,
    revoked: watch::Receiver<bool>,
}

struct ClaimTopic {
    name: Arc<String>,
    next_offset: u64,
    offsets: watch::Receiver<u64>,
}

impl Claim {
    /// Wait for the next batch of up to `max` records.
    ///
    /// Returns whatever is immediately available, waiting only when nothing is. Returns `None`
    /// once the claim has been revoked.
    pub async fn next_batch(&mut self, max: usize) -> Result<Option<Vec<ClaimRecord>>> {
        loop {
            if *self.revoked.borrow() {
                return Ok(None);
            }
            // Mark the current offsets as seen before fetching, so that any write landing after
            // the fetch wakes the wait below.
            for topic in self.topics.iter_mut() {
                topic.offsets.borrow_and_update();
            }
            let batch = self.fetch_available(max).await?;
            if !batch.is_empty() {
                return Ok(Some(batch));
            }

            let Self { topics, revoked, .. } = self;
            let offsets_changed = futures::future::select_all(topics.iter_mut().map(|topic| Box::pin(topic.offsets.changed())));
            tokio::select! {
                res = revoked.changed() => {
                    if res.is_err() || *revoked.borrow() {
                        return Ok(None);
                    }
                }
                (res, _, _) = offsets_changed => res.context("topic partition offset signal closed")?,
            }
        }
    }

    async fn fetch_available(&mut self, max: usize) -> Result<Vec<ClaimRecord>> {
        let mut batch = Vec::new();
        let count = self.topics.len();
        for idx in 0..count {
            if batch.len() >= max {
                break;
            }
            let topic = &mut self.topics[(self.cursor + idx) % count];
            let records = self.broker.fetch(&topic.name, self.partition, topic.next_offset, max - batch.len()).await?;
            if let Some(last) = records.last() {
                topic.next_offset = last.offset + 1;
            }
            batch.extend(records.into_iter().map(|record| ClaimRecord {
                topic: topic.name.clone(),
                partition: self.partition,
                record,
            }));
        }
        self.cursor = (self.cursor + 1) % count.max(1);
        Ok(batch)
    }
}

/// A member of a consumer group.
pub struct ConsumerGroup {
    broker: Broker,
    coordinator: Coordinator,
    group: Arc<String>,
    member: Arc<String>,
    strategy: Arc<dyn BalanceStrategy>,
}

impl ConsumerGroup {
    /// Join the given group as the given member.
    pub fn new(broker: Broker, coordinator: Coordinator, group: &str, member: &str, strategy: Arc<dyn BalanceStrategy>) -> Self {
        coordinator.join(group, member);
        Self {
            broker,
            coordinator,
            group: Arc::new(group.into()),
            member: Arc::new(member.into()),
            strategy,
        }
    }

    /// Leave the group, triggering a rebalance of the remaining members.
    pub fn close(&self) {
        self.coordinator.leave(&self.group, &self.member);
    }

    /// Run a single session of this member over the given topics.
    ///
    /// Returns `Ok` once the session ends because of a rebalance or shutdown, after every worker
    /// has been cleaned up. Returns an error if the plan could not be computed, if any `setup`
    /// failed, or if any worker failed.
    #[tracing::instrument(level = "debug", skip(self, topics, handler, shutdown), fields(group = %self.group, member = %self.member))]
    pub async fn consume<H: GroupHandler>(&self, topics: &[&str], handler: &H, shutdown: &mut broadcast::Receiver<()>) -> Result<()> {
        let (generation, members, mut generation_rx) = self.coordinator.snapshot(&self.group);
        let mut topic_partitions = BTreeMap::new();
        for topic in topics {
            topic_partitions.insert(topic.to_string(), self.broker.partitions(topic)?);
        }
        let plan = self
            .strategy
            .plan(&members, &topic_partitions)
            .with_context(|| format!("error computing {} plan for group {}", self.strategy.name(), self.group))?;
        let assignment = plan.get(self.member.as_str()).cloned().unwrap_or_default();

        // Regroup the assignment by partition index, then take ownership of every partition in
        // sorted order. A rebalance while waiting on a lock ends the session early.
        let mut claims: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for (topic, partitions) in assignment {
            for partition in partitions {
                claims.entry(partition).or_default().push(topic.clone());
            }
        }
        let mut guards: Vec<OwnedMutexGuard<()>> = Vec::new();
        for (partition, topics) in claims.iter() {
            for topic in topics {
                let lock = self.coordinator.partition_lock(&self.group, topic, *partition);
                tokio::select! {
                    guard = lock.lock_owned() => guards.push(guard),
                    _ = generation_rx.changed() => return Ok(()),
                    _ = shutdown.recv() => return Ok(()),
                }
            }
        }
        tracing::debug!(generation, claims = ?claims, "session started");

        let session = GroupSession {
            broker: self.broker.clone(),
            group: self.group.clone(),
            member: self.member.clone(),
            generation,
        };

        // Setup one worker per claim, cleaning up those already setup on failure.
        let mut workers = Vec::with_capacity(claims.len());
        for partition in claims.keys() {
            match handler.setup(&session, *partition).await {
                Ok(worker) => workers.push((*partition, worker)),
                Err(err) => {
                    for (_, mut worker) in workers {
                        if let Err(err) = worker.cleanup(&session).await {
                            tracing::error!(error = ?err, "error cleaning up worker after failed setup");
                        }
                    }
                    return Err(err.context(format!("error setting up partition {}", partition)));
                }
            }
        }

        // Spawn a task per claim.
        let (revoke_tx, revoke_rx) = watch::channel(false);
        let mut tasks = FuturesUnordered::new();
        for (partition, mut worker) in workers {
            let mut claim = self.new_claim(partition, &claims[&partition], revoke_rx.clone()).await?;
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                let res = worker.consume_claim(&session, &mut claim).await;
                (worker, res)
            }));
        }

        // Run until rebalance, shutdown or a worker failure.
        let mut finished = Vec::new();
        let mut outcome = Ok(());
        loop {
            tokio::select! {
                _ = generation_rx.changed() => break,
                _ = shutdown.recv() => break,
                Some(joined) = tasks.next(), if !tasks.is_empty() => match joined {
                    Ok((worker, Ok(()))) => finished.push(worker),
                    Ok((worker, Err(err))) => {
                        finished.push(worker);
                        outcome = Err(err.context("error from claim worker"));
                        break;
                    }
                    Err(err) => {
                        outcome = Err(anyhow::Error::from(err).context("claim worker task failed"));
                        break;
                    }
                },
            }
        }

        // Revoke every claim & clean up.
        let _ = revoke_tx.send(true);
        while let Some(joined) = tasks.next().await {
            match joined {
                Ok((worker, res)) => {
                    if let Err(err) = res {
                        tracing::error!(error = ?err, "error from claim worker during revocation");
                    }
                    finished.push(worker);
                }
                Err(err) => tracing::error!(error = ?err, "claim worker task failed during revocation"),
            }
        }
        for mut worker in finished {
            if let Err(err) = worker.cleanup(&session).await {
                tracing::error!(error = ?err, "error cleaning up claim worker");
            }
        }
        drop(guards);
        tracing::debug!(generation, "session ended");
        outcome
    }

    async fn new_claim(&self, partition: u32, topics: &[String], revoked: watch::Receiver<bool>) -> Result<Claim> {
        let mut claim_topics = Vec::with_capacity(topics.len());
        for topic in topics {
            let next_offset = self.broker.committed_offset(&self.group, topic, partition).await?.unwrap_or(0);
            claim_topics.push(ClaimTopic {
                name: Arc::new(topic.clone()),
                next_offset,
                offsets: self.broker.subscribe_offsets(topic, partition)?,
            });
        }
        Ok(Claim {
            broker: self.broker.clone(),
            partition,
            topics: claim_topics,
            cursor: 0,
            revoked,
        })
    }

    /// Spawn the consume loop of this member, which runs sessions back to back until shutdown.
    ///
    /// Shutdown is checked without blocking before and after every session. A failed session is
    /// logged & retried after a delay. The member leaves its group when the loop exits.
    pub fn spawn<H: GroupHandler>(self, topics: Vec<String>, handler: H, shutdown_tx: broadcast::Sender<()>) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let mut shutdown_check = shutdown_tx.subscribe();
            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            loop {
                if shutdown_signalled(&mut shutdown_check) {
                    break;
                }
                let mut session_shutdown = shutdown_tx.subscribe();
                let res = self.consume(&topic_refs, &handler, &mut session_shutdown).await;
                if shutdown_signalled(&mut shutdown_check) {
                    break;
                }
                if let Err(err) = res {
                    tracing::error!(error = ?err, group = %self.group, "error during consumer group session");
                    tokio::select! {
                        _ = tokio::time::sleep(SESSION_RETRY_DELAY) => (),
                        _ = shutdown_check.recv() => break,
                    }
                }
            }
            self.close();
            tracing::debug!(group = %self.group, "consumer group member has shutdown");
            Ok(())
        })
    }
}

/// Check, without blocking, whether shutdown has been signalled on the given channel.
fn shutdown_signalled(rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}
