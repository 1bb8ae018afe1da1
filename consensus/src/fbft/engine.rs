/// Consensus Engine - runs the FBFT state machine on tokio
///
/// A single task owns the `Consensus` machine and is the only writer of
/// round state. It consumes three inputs:
/// - inbound network messages
/// - block submissions and shutdown from `EngineHandle`
/// - timer firings
///
/// and carries out the actions the machine returns. Status snapshots are
/// published on a watch channel so readers never touch the machine.

use super::types::{Action, CommitCertificate, ConsensusStatus};
use super::Consensus;
use crate::crypto::Hash;
use crate::network::{Gateway, InboundMessage};
use crate::pacemaker::TimerToken;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Depth of the command/timer queue
const EVENT_QUEUE: usize = 256;

/// Consensus engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Consensus engine has stopped")]
    Stopped,
}

/// Block-application collaborator
pub trait BlockSink: Send + Sync {
    /// Called once per finalized block, in height order
    fn committed(&self, certificate: CommitCertificate);

    /// Operators are alerted when view changes keep failing
    fn liveness_alarm(&self, consecutive: u32) {
        let _ = consecutive;
    }
}

/// Work items for the engine task
#[derive(Debug)]
pub enum EngineEvent {
    Inbound(InboundMessage),
    Timeout(TimerToken),
    SubmitBlock(Hash),
    Shutdown,
}

/// Control surface of a running engine
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    status: watch::Receiver<ConsensusStatus>,
}

impl EngineHandle {
    /// Queue the next block to propose
    pub async fn submit_block(&self, block_hash: Hash) -> Result<(), EngineError> {
        self.events
            .send(EngineEvent::SubmitBlock(block_hash))
            .await
            .map_err(|_| EngineError::Stopped)
    }

    /// Latest published status
    pub fn status(&self) -> ConsensusStatus {
        self.status.borrow().clone()
    }

    /// Receiver that is notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<ConsensusStatus> {
        self.status.clone()
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.events
            .send(EngineEvent::Shutdown)
            .await
            .map_err(|_| EngineError::Stopped)
    }
}

/// Main consensus engine
pub struct ConsensusEngine {
    consensus: Consensus,
    gateway: Arc<dyn Gateway>,
    sink: Arc<dyn BlockSink>,
    events: mpsc::Receiver<EngineEvent>,
    /// Timers must not keep the queue open once every handle is gone
    timer_events: mpsc::WeakSender<EngineEvent>,
    inbound: mpsc::Receiver<InboundMessage>,
    timers: HashMap<TimerToken, JoinHandle<()>>,
    status: watch::Sender<ConsensusStatus>,
}

impl ConsensusEngine {
    /// Start the engine task
    pub fn spawn(
        consensus: Consensus,
        gateway: Arc<dyn Gateway>,
        sink: Arc<dyn BlockSink>,
        inbound: mpsc::Receiver<InboundMessage>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (status_tx, status_rx) = watch::channel(consensus.status());

        let engine = Self {
            consensus,
            gateway,
            sink,
            events: events_rx,
            timer_events: events_tx.downgrade(),
            inbound,
            timers: HashMap::new(),
            status: status_tx,
        };
        let task = tokio::spawn(engine.run());

        let handle = EngineHandle {
            events: events_tx,
            status: status_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        let actions = self.consensus.start();
        self.execute(actions).await;

        loop {
            let event = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                Some(message) = self.inbound.recv() => EngineEvent::Inbound(message),
            };

            match event {
                EngineEvent::Inbound(message) => self.on_inbound(message).await,
                EngineEvent::Timeout(token) => {
                    self.timers.remove(&token);
                    let actions = self.consensus.on_timeout(token);
                    self.execute(actions).await;
                }
                EngineEvent::SubmitBlock(block_hash) => {
                    let actions = self.consensus.submit_block(block_hash);
                    self.execute(actions).await;
                }
                EngineEvent::Shutdown => break,
            }
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        info!("Consensus engine for member {} stopped", self.consensus.local_index());
    }

    async fn on_inbound(&mut self, message: InboundMessage) {
        match self.consensus.handle_message(&message.bytes) {
            Ok(actions) => self.execute(actions).await,
            Err(reason) if reason.is_benign() => {
                debug!("Dropped message from {}: {}", message.sender, reason);
            }
            Err(reason) => {
                warn!("Rejected message from {}: {}", message.sender, reason);
            }
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { group, bytes } => {
                    if let Err(e) = self.gateway.broadcast(&group, bytes).await {
                        warn!("Broadcast to {} failed: {}", group, e);
                    }
                }
                Action::SendTo { peer, bytes } => {
                    if let Err(e) = self.gateway.send_to(&peer, bytes).await {
                        warn!("Send to {} failed: {}", peer, e);
                    }
                }
                Action::ArmTimer { token, after } => {
                    let events = self.timer_events.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        if let Some(events) = events.upgrade() {
                            let _ = events.send(EngineEvent::Timeout(token)).await;
                        }
                    });
                    self.timers.insert(token, timer);
                }
                Action::CancelTimer { token } => {
                    if let Some(timer) = self.timers.remove(&token) {
                        timer.abort();
                    }
                }
                Action::Commit(certificate) => self.sink.committed(certificate),
                Action::LivenessAlarm { consecutive } => self.sink.liveness_alarm(consecutive),
            }
        }
        self.status.send_replace(self.consensus.status());
    }
}
