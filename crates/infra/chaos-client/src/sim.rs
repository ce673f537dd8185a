//! In-process ledger with tunable latency and failure injection.
//!
//! Transactions are cut into blocks of [`SimulationConfig::block_size`] as they commit and
//! each valid commit publishes a completion event. Recent events are kept so a subscription
//! can resume from an earlier block.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use rand::Rng;
use tokio::{
    sync::{broadcast, oneshot, watch},
    time::{sleep, timeout},
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    CallFailure, CommitStatus, CompletionEvent, ConnectionState, EndorsedTransaction,
    EventStream, LedgerClient, LedgerError, Proposal, SubmittedTransaction,
};

/// Events kept for replay.
const HISTORY_CAPACITY: usize = 4_096;

/// Live event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// Simulated ledger behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Delay added to every endorse, submit and evaluate call.
    pub latency: Duration,
    /// Delay between a submit and its commit.
    pub commit_latency: Duration,
    /// Transactions per block.
    pub block_size: usize,
    /// Probability a proposal cannot be built.
    pub proposal_failure_rate: f64,
    /// Probability an endorsement fails.
    pub endorse_failure_rate: f64,
    /// Probability an evaluation fails.
    pub evaluate_failure_rate: f64,
    /// Probability a commit is invalid.
    pub validation_failure_rate: f64,
    /// Validation code reported for invalid commits.
    pub validation_failure_code: i32,
    /// Probability a valid commit never publishes its event.
    pub event_drop_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(20),
            commit_latency: Duration::from_millis(200),
            block_size: 10,
            proposal_failure_rate: 0.0,
            endorse_failure_rate: 0.0,
            evaluate_failure_rate: 0.0,
            validation_failure_rate: 0.0,
            validation_failure_code: CommitStatus::ENDORSEMENT_POLICY_FAILURE,
            event_drop_rate: 0.0,
        }
    }
}

impl SimulationConfig {
    /// Sets the per-call latency.
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Sets the submit to commit latency.
    pub const fn with_commit_latency(mut self, latency: Duration) -> Self {
        self.commit_latency = latency;
        self
    }

    /// Sets the number of transactions per block.
    pub const fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the proposal build failure probability.
    pub const fn with_proposal_failure_rate(mut self, rate: f64) -> Self {
        self.proposal_failure_rate = rate;
        self
    }

    /// Sets the endorsement failure probability.
    pub const fn with_endorse_failure_rate(mut self, rate: f64) -> Self {
        self.endorse_failure_rate = rate;
        self
    }

    /// Sets the evaluation failure probability.
    pub const fn with_evaluate_failure_rate(mut self, rate: f64) -> Self {
        self.evaluate_failure_rate = rate;
        self
    }

    /// Sets the invalid commit probability.
    pub const fn with_validation_failure_rate(mut self, rate: f64) -> Self {
        self.validation_failure_rate = rate;
        self
    }

    /// Sets the validation code reported for invalid commits.
    pub const fn with_validation_failure_code(mut self, code: i32) -> Self {
        self.validation_failure_code = code;
        self
    }

    /// Sets the dropped event probability.
    pub const fn with_event_drop_rate(mut self, rate: f64) -> Self {
        self.event_drop_rate = rate;
        self
    }
}

/// Returns true with probability `rate`.
fn roll(rate: f64) -> bool {
    rate > 0.0 && rand::rng().random::<f64>() < rate
}

fn unavailable() -> CallFailure {
    CallFailure::new("14 UNAVAILABLE: connection not ready")
}

#[derive(Debug)]
struct Chain {
    height: u64,
    txs_in_block: usize,
    history: VecDeque<CompletionEvent>,
}

impl Chain {
    fn next_slot(&mut self, block_size: usize) -> u64 {
        let block = self.height;
        self.txs_in_block += 1;
        if self.txs_in_block >= block_size.max(1) {
            self.height += 1;
            self.txs_in_block = 0;
        }
        block
    }
}

#[derive(Debug)]
struct Inner {
    config: SimulationConfig,
    connected: watch::Sender<bool>,
    chain: Mutex<Chain>,
    events: broadcast::Sender<CompletionEvent>,
    interrupt: Mutex<CancellationToken>,
    proposals: AtomicU64,
    subscriptions: AtomicU64,
}

/// A ledger simulated in memory. Clones share the same chain.
#[derive(Debug, Clone)]
pub struct SimulatedLedger {
    inner: Arc<Inner>,
}

impl SimulatedLedger {
    /// Creates a connected ledger at block 1.
    pub fn new(config: SimulationConfig) -> Self {
        let (connected, _) = watch::channel(true);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                connected,
                chain: Mutex::new(Chain { height: 1, txs_in_block: 0, history: VecDeque::new() }),
                events,
                interrupt: Mutex::new(CancellationToken::new()),
                proposals: AtomicU64::new(0),
                subscriptions: AtomicU64::new(0),
            }),
        }
    }

    /// Connects or disconnects the ledger. Disconnecting ends open event streams.
    pub fn set_connected(&self, connected: bool) {
        let previous = self.inner.connected.send_replace(connected);
        if previous && !connected {
            self.interrupt_event_streams();
        }
        if previous != connected {
            info!(connected, "simulated ledger connection changed");
        }
    }

    /// Returns true while the ledger accepts calls.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Ends every open event stream.
    pub fn interrupt_event_streams(&self) {
        let mut token = self.inner.interrupt.lock();
        std::mem::take(&mut *token).cancel();
        debug!("interrupted simulated event streams");
    }

    /// Number of proposals built.
    pub fn proposals_built(&self) -> u64 {
        self.inner.proposals.load(Ordering::Relaxed)
    }

    /// Number of event subscriptions opened.
    pub fn subscriptions(&self) -> u64 {
        self.inner.subscriptions.load(Ordering::Relaxed)
    }

    /// Block currently being filled.
    pub fn height(&self) -> u64 {
        self.inner.chain.lock().height
    }

    /// Orders a transaction into the current block and publishes its event when valid.
    fn commit(&self, txn_id: String, function: String, args: &[String]) -> CommitStatus {
        let config = &self.inner.config;
        let code = if roll(config.validation_failure_rate) {
            config.validation_failure_code
        } else {
            CommitStatus::VALID
        };
        let dropped = roll(config.event_drop_rate);

        let mut chain = self.inner.chain.lock();
        let block_number = chain.next_slot(config.block_size);
        if code == CommitStatus::VALID && !dropped {
            let event = CompletionEvent {
                transaction_id: txn_id,
                block_number,
                event_name: function,
                payload: args.join(",").into_bytes(),
            };
            if chain.history.len() == HISTORY_CAPACITY {
                chain.history.pop_front();
            }
            chain.history.push_back(event.clone());
            // Sent under the chain lock so a concurrent subscribe sees it exactly once.
            let _ = self.inner.events.send(event);
        }
        CommitStatus::new(code)
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    type Proposal = SimProposal;

    fn new_proposal(&self, function: &str, args: &[String]) -> Result<SimProposal, LedgerError> {
        self.inner.proposals.fetch_add(1, Ordering::Relaxed);
        if roll(self.inner.config.proposal_failure_rate) {
            return Err(LedgerError::Proposal(CallFailure::new(
                "simulated signing identity unavailable",
            )));
        }
        Ok(SimProposal {
            ledger: self.clone(),
            txn_id: hex::encode(rand::random::<[u8; 32]>()),
            function: function.to_owned(),
            args: args.to_vec(),
        })
    }

    async fn chaincode_events(&self, start_block: Option<u64>) -> Result<EventStream, LedgerError> {
        if !self.is_connected() {
            return Err(LedgerError::Events(unavailable()));
        }
        self.inner.subscriptions.fetch_add(1, Ordering::Relaxed);

        let (backlog, receiver) = {
            let chain = self.inner.chain.lock();
            let receiver = self.inner.events.subscribe();
            let backlog: Vec<_> = start_block
                .map(|start| {
                    chain.history.iter().filter(|e| e.block_number >= start).cloned().collect()
                })
                .unwrap_or_default();
            (backlog, receiver)
        };
        let interrupted = self.inner.interrupt.lock().clone();

        let live = BroadcastStream::new(receiver).map(|item| match item {
            Ok(event) => Ok(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Err(LedgerError::Events(
                CallFailure::new(format!("event stream lagged, {skipped} events skipped")),
            )),
        });
        let events: EventStream = Box::pin(
            stream::iter(backlog.into_iter().map(Ok))
                .chain(live)
                .take_until(interrupted.cancelled_owned()),
        );

        Ok(events)
    }

    async fn wait_for_ready(&self, limit: Duration) -> ConnectionState {
        let mut connected = self.inner.connected.subscribe();
        let ready = timeout(limit, connected.wait_for(|connected| *connected))
            .await
            .is_ok_and(|result| result.is_ok());
        if ready { ConnectionState::Ready } else { ConnectionState::NotConnected }
    }
}

/// Proposal built by [`SimulatedLedger`].
#[derive(Debug)]
pub struct SimProposal {
    ledger: SimulatedLedger,
    txn_id: String,
    function: String,
    args: Vec<String>,
}

#[async_trait]
impl Proposal for SimProposal {
    type Endorsed = SimEndorsed;

    fn transaction_id(&self) -> &str {
        &self.txn_id
    }

    async fn endorse(self) -> Result<SimEndorsed, LedgerError> {
        sleep(self.ledger.inner.config.latency).await;
        if !self.ledger.is_connected() {
            return Err(LedgerError::Endorse(unavailable()));
        }
        if roll(self.ledger.inner.config.endorse_failure_rate) {
            return Err(LedgerError::Endorse(
                CallFailure::new("10 ABORTED: failed to endorse transaction").with_details(vec![
                    format!(
                        "peer0.org1.example.com:7051: chaincode response 500, {} failed",
                        self.function
                    ),
                ]),
            ));
        }
        Ok(SimEndorsed { proposal: self })
    }

    async fn evaluate(self) -> Result<Vec<u8>, LedgerError> {
        sleep(self.ledger.inner.config.latency).await;
        if !self.ledger.is_connected() {
            return Err(LedgerError::Evaluate(unavailable()));
        }
        if roll(self.ledger.inner.config.evaluate_failure_rate) {
            return Err(LedgerError::Evaluate(CallFailure::new(format!(
                "2 UNKNOWN: evaluate call to {} failed",
                self.function
            ))));
        }
        Ok(self.args.join(",").into_bytes())
    }
}

/// Endorsed transaction from [`SimulatedLedger`].
#[derive(Debug)]
pub struct SimEndorsed {
    proposal: SimProposal,
}

#[async_trait]
impl EndorsedTransaction for SimEndorsed {
    type Submitted = SimSubmitted;

    async fn submit(self) -> Result<SimSubmitted, LedgerError> {
        let SimProposal { ledger, txn_id, function, args } = self.proposal;
        sleep(ledger.inner.config.latency).await;
        if !ledger.is_connected() {
            return Err(LedgerError::Submit(unavailable()));
        }

        let (sender, status) = oneshot::channel();
        tokio::spawn(async move {
            sleep(ledger.inner.config.commit_latency).await;
            let _ = sender.send(ledger.commit(txn_id, function, &args));
        });
        Ok(SimSubmitted { status })
    }
}

/// Transaction accepted for ordering by [`SimulatedLedger`].
#[derive(Debug)]
pub struct SimSubmitted {
    status: oneshot::Receiver<CommitStatus>,
}

#[async_trait]
impl SubmittedTransaction for SimSubmitted {
    async fn status(self) -> Result<CommitStatus, LedgerError> {
        self.status
            .await
            .map_err(|_| LedgerError::CommitStatus(CallFailure::new("commit status stream closed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(config: SimulationConfig) -> SimulatedLedger {
        SimulatedLedger::new(config.with_latency(Duration::ZERO))
    }

    async fn commit_one(ledger: &SimulatedLedger) -> (String, CommitStatus) {
        let proposal = ledger.new_proposal("createUpdateChaosAsset", &["cd1".into()]).unwrap();
        let txn_id = proposal.transaction_id().to_owned();
        let status = proposal.endorse().await.unwrap().submit().await.unwrap().status().await;
        (txn_id, status.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn commits_publish_events_in_block_order() {
        let ledger = ledger(SimulationConfig::default().with_block_size(2));
        let mut events = ledger.chaincode_events(None).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let (txn_id, status) = commit_one(&ledger).await;
            assert!(status.is_valid());
            ids.push(txn_id);
        }

        let mut blocks = Vec::new();
        for _ in 0..3 {
            let event = events.next().await.unwrap().unwrap();
            blocks.push((event.transaction_id, event.block_number));
        }
        assert_eq!(
            blocks,
            vec![(ids[0].clone(), 1), (ids[1].clone(), 1), (ids[2].clone(), 2)]
        );
        assert_eq!(ledger.height(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_replays_from_start_block() {
        let ledger = ledger(SimulationConfig::default().with_block_size(1));
        for _ in 0..3 {
            commit_one(&ledger).await;
        }

        let replayed: Vec<_> = ledger
            .chaincode_events(Some(2))
            .await
            .unwrap()
            .take(2)
            .map(|event| event.unwrap().block_number)
            .collect()
            .await;
        assert_eq!(replayed, vec![2, 3]);
        assert_eq!(ledger.subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_ends_open_streams() {
        let ledger = ledger(SimulationConfig::default());
        let mut events = ledger.chaincode_events(None).await.unwrap();

        ledger.interrupt_event_streams();
        assert!(events.next().await.is_none());

        // New subscriptions are unaffected by the earlier interrupt.
        let mut fresh = ledger.chaincode_events(None).await.unwrap();
        commit_one(&ledger).await;
        assert!(fresh.next().await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_ledger_is_not_ready() {
        let ledger = ledger(SimulationConfig::default());
        assert_eq!(ledger.wait_for_ready(Duration::from_secs(1)).await, ConnectionState::Ready);

        ledger.set_connected(false);
        assert_eq!(
            ledger.wait_for_ready(Duration::from_secs(1)).await,
            ConnectionState::NotConnected
        );
        assert!(ledger.chaincode_events(None).await.is_err());

        let proposal = ledger.new_proposal("readChaosAsset", &[]).unwrap();
        assert!(matches!(proposal.evaluate().await, Err(LedgerError::Evaluate(_))));

        ledger.set_connected(true);
        assert_eq!(ledger.wait_for_ready(Duration::from_secs(1)).await, ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_and_dropped_commits_publish_nothing() {
        let invalid = ledger(
            SimulationConfig::default()
                .with_validation_failure_rate(1.0)
                .with_validation_failure_code(CommitStatus::PHANTOM_READ_CONFLICT),
        );
        let (_, status) = commit_one(&invalid).await;
        assert_eq!(status, CommitStatus::new(CommitStatus::PHANTOM_READ_CONFLICT));

        let dropping = ledger(SimulationConfig::default().with_event_drop_rate(1.0));
        let (_, status) = commit_one(&dropping).await;
        assert!(status.is_valid());

        assert!(invalid.inner.chain.lock().history.is_empty());
        assert!(dropping.inner.chain.lock().history.is_empty());
    }

    #[test]
    fn proposal_ids_are_unique_hex() {
        let ledger = ledger(SimulationConfig::default());
        let a = ledger.new_proposal("readChaosAsset", &[]).unwrap();
        let b = ledger.new_proposal("readChaosAsset", &[]).unwrap();

        assert_eq!(a.transaction_id().len(), 64);
        assert_ne!(a.transaction_id(), b.transaction_id());
        assert_eq!(ledger.proposals_built(), 2);
    }
}
