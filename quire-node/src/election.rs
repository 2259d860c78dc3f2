//! Uptime-ranked leader election.
//!
//! Every round:
//! ```text
//!   self uptime ──────────────────────────┐
//!   GET /uptime → peer 1  (≤ timeout) ────┤
//!   GET /uptime → peer 2  (≤ timeout) ────┼──► rank: max uptime, lowest id on tie
//!   peer 3 in cooldown    (skipped)       │          │
//!                                         │          ▼
//!                                         └──► Main iff winner == self
//! ```
//!
//! Probes run concurrently, so a dead peer costs one timeout per round at
//! most, and peers that failed recently are not probed again until their
//! cooldown expires. Role changes only as the result of a round.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

use crate::config::NodeConfig;
use crate::peer::PeerClient;
use crate::protocol::{ElectionReport, HealthReport, UptimeReport};

/// Elected role of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Before the first round completes
    #[default]
    Unknown,
    Main,
    Backup,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Unknown => "unknown",
            Role::Main => "main",
            Role::Backup => "backup",
        };
        f.write_str(name)
    }
}

/// Outcome of the latest round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectionState {
    pub role: Role,
    pub leader_id: Option<String>,
    /// `host:port` of the leader
    pub leader_addr: Option<String>,
}

/// One entry in a ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub uptime: f64,
}

impl Candidate {
    pub fn new(id: impl Into<String>, uptime: f64) -> Self {
        Self {
            id: id.into(),
            uptime,
        }
    }
}

/// Pick the winner: greatest uptime, lexicographically lowest id on a tie.
pub fn rank_candidates(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().max_by(|a, b| {
        a.uptime
            .total_cmp(&b.uptime)
            .then_with(|| b.id.cmp(&a.id))
    })
}

/// Last failure per peer address; peers inside the cooldown are skipped.
#[derive(Debug)]
pub struct FailureRecord {
    failures: HashMap<String, Instant>,
    cooldown: Duration,
}

impl FailureRecord {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            failures: HashMap::new(),
            cooldown,
        }
    }

    pub fn record_failure(&mut self, key: impl Into<String>, at: Instant) {
        self.failures.insert(key.into(), at);
    }

    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn in_cooldown(&self, key: &str, now: Instant) -> bool {
        self.failures
            .get(key)
            .is_some_and(|failed_at| now.saturating_duration_since(*failed_at) < self.cooldown)
    }

    pub fn last_failure(&self, key: &str) -> Option<Instant> {
        self.failures.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs election rounds and owns this node's [`ElectionState`].
pub struct Elector {
    config: Arc<NodeConfig>,
    client: PeerClient,
    started_at: Instant,
    /// Latest outcome; receivers are notified on every change
    state: watch::Sender<ElectionState>,
    failures: Mutex<FailureRecord>,
    /// Serializes the periodic loop and `/election`
    round: Mutex<()>,
}

impl Elector {
    pub fn new(config: Arc<NodeConfig>, client: PeerClient) -> Self {
        let cooldown = config.cooldown();
        Self {
            config,
            client,
            started_at: Instant::now(),
            state: watch::channel(ElectionState::default()).0,
            failures: Mutex::new(FailureRecord::new(cooldown)),
            round: Mutex::new(()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.id
    }

    /// Seconds since this node started.
    pub fn uptime(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn uptime_report(&self) -> UptimeReport {
        UptimeReport {
            id: self.config.id.clone(),
            uptime: self.uptime(),
        }
    }

    pub fn state(&self) -> ElectionState {
        self.state.borrow().clone()
    }

    pub fn role(&self) -> Role {
        self.state.borrow().role
    }

    /// Watch for role or leader changes.
    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state.subscribe()
    }

    pub fn health_report(&self) -> HealthReport {
        let state = self.state.borrow();
        HealthReport {
            status: "ok".to_string(),
            role: state.role,
            main: state.leader_id.clone(),
        }
    }

    pub fn election_report(&self) -> ElectionReport {
        let state = self.state.borrow();
        ElectionReport {
            role: state.role,
            main: state.leader_id.clone(),
        }
    }

    /// Whether `addr` is currently skipped by election.
    pub async fn in_cooldown(&self, addr: &str) -> bool {
        self.failures.lock().await.in_cooldown(addr, Instant::now())
    }

    /// Run one election round and publish its outcome.
    pub async fn run_round(&self) -> ElectionState {
        let _round = self.round.lock().await;

        let targets: Vec<_> = {
            let failures = self.failures.lock().await;
            let now = Instant::now();
            self.config
                .peers
                .iter()
                .filter(|peer| peer.id != self.config.id)
                .filter(|peer| {
                    let skip = failures.in_cooldown(&peer.addr(), now);
                    if skip {
                        log::trace!("Skipping peer {} (cooling down)", peer.id);
                    }
                    !skip
                })
                .cloned()
                .collect()
        };

        let probes = targets.iter().map(|peer| async move {
            let addr = peer.addr();
            let result = self.client.uptime(&addr).await;
            (addr, result)
        });
        let results = futures_util::future::join_all(probes).await;

        let mut candidates = vec![Candidate::new(self.config.id.clone(), self.uptime())];
        {
            let mut failures = self.failures.lock().await;
            for (addr, result) in results {
                match result {
                    Ok(report) => {
                        failures.clear(&addr);
                        candidates.push(Candidate::new(report.id, report.uptime));
                    }
                    Err(e) => {
                        log::debug!("Peer probe failed: {e}");
                        failures.record_failure(addr, Instant::now());
                    }
                }
            }
        }

        let next = self.decide(&candidates);
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            log::info!(
                "Election: role {}, main {} @ {}",
                next.role,
                next.leader_id.as_deref().unwrap_or("-"),
                next.leader_addr.as_deref().unwrap_or("-"),
            );
            *state = next.clone();
            true
        });
        next
    }

    fn decide(&self, candidates: &[Candidate]) -> ElectionState {
        let winner = rank_candidates(candidates)
            .map(|c| c.id.clone())
            .unwrap_or_else(|| self.config.id.clone());

        if winner == self.config.id {
            return ElectionState {
                role: Role::Main,
                leader_id: Some(winner),
                leader_addr: Some(self.config.self_addr()),
            };
        }

        let leader_addr = self.config.peer(&winner).map(|p| p.addr());
        if leader_addr.is_none() {
            log::warn!("Elected leader {winner} is not in the peer registry");
        }
        ElectionState {
            role: Role::Backup,
            leader_id: Some(winner),
            leader_addr,
        }
    }

    /// Periodic election loop; exits when `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.election_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_round().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Election loop stopped");
    }
}
