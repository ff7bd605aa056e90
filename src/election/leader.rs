//! Term-based leader election over the coordination store
//!
//! ```text
//! leader_election:<svc>:leader            current LeaderInfo (TTL = leader_ttl)
//! leader_election:<svc>:candidates:<id>   candidacy for the running term
//! leader_election:<svc>:term:<n>          first writer wins term n
//! leader_election:<svc>:heartbeat:<id>    last heartbeat of the leader
//! ```
//!
//! An instance only becomes leader after winning `term:<n>` with
//! `set_if_absent` and then installing the leader record conditionally, so at
//! most one instance ever holds a given term.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ElectionConfig;
use crate::coordination::CoordinationStore;
use crate::error::{CoreError, Result};

const TERM_SCAN_LIMIT: usize = 1_000;
/// Term keys outlive many leader TTLs so terms never repeat
const TERM_KEY_TTL_FACTOR: u32 = 20;

/// Leader record stored under `leader_election:<svc>:leader`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub service_name: String,
    pub instance_id: String,
    pub term: u64,
    pub elected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl LeaderInfo {
    fn same_reign(&self, other: &LeaderInfo) -> bool {
        self.instance_id == other.instance_id && self.term == other.term
    }
}

/// Cheap, cloneable view of "am I the leader"
#[derive(Debug, Clone, Default)]
pub struct LeadershipHandle(Arc<AtomicBool>);

impl LeadershipHandle {
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, leading: bool) -> bool {
        self.0.swap(leading, Ordering::AcqRel)
    }
}

/// Election callbacks. Invoked from the election task; keep them short.
#[async_trait]
pub trait ElectionListener: Send + Sync {
    async fn on_elected(&self, _info: &LeaderInfo) {}

    /// `info` is the reign that just ended
    async fn on_deposed(&self, _info: &LeaderInfo) {}

    async fn on_leader_changed(&self, _previous: Option<&LeaderInfo>, _current: Option<&LeaderInfo>) {}
}

#[derive(Default)]
struct ElectionState {
    term: u64,
    /// Raw leader record we installed, used as the CAS witness
    own_record: Option<String>,
    observed: Option<LeaderInfo>,
}

pub struct LeaderElection {
    store: Arc<dyn CoordinationStore>,
    config: ElectionConfig,
    instance_id: String,
    leading: LeadershipHandle,
    state: Mutex<ElectionState>,
    listeners: RwLock<Vec<Arc<dyn ElectionListener>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElection {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: ElectionConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            config,
            instance_id: instance_id.into(),
            leading: LeadershipHandle::default(),
            state: Mutex::new(ElectionState::default()),
            listeners: RwLock::new(Vec::new()),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn is_leader(&self) -> bool {
        self.leading.is_leader()
    }

    pub fn leadership(&self) -> LeadershipHandle {
        self.leading.clone()
    }

    pub async fn add_listener(&self, listener: Arc<dyn ElectionListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Highest term this instance has seen or run for
    pub async fn term(&self) -> u64 {
        self.state.lock().await.term
    }

    fn key(&self, suffix: &str) -> String {
        format!("leader_election:{}:{}", self.config.service_name, suffix)
    }

    fn leader_key(&self) -> String {
        self.key("leader")
    }

    fn leader_ttl(&self) -> Duration {
        Duration::from_millis(self.config.leader_ttl_ms)
    }

    fn election_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.election_timeout_ms as i64)
    }

    /// Current leader as recorded in the store
    pub async fn get_leader_info(&self) -> Result<Option<LeaderInfo>> {
        Ok(self.read_leader().await?.map(|(_, info)| info))
    }

    async fn read_leader(&self) -> Result<Option<(String, LeaderInfo)>> {
        let Some(raw) = self.store.get(&self.leader_key()).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<LeaderInfo>(&raw) {
            Ok(info) => Ok(Some((raw, info))),
            Err(e) => {
                // Treat as stale so the next election overwrites it
                warn!(error = %e, "Unreadable leader record");
                Ok(Some((
                    raw,
                    LeaderInfo {
                        service_name: self.config.service_name.clone(),
                        instance_id: String::new(),
                        term: 0,
                        elected_at: DateTime::<Utc>::MIN_UTC,
                        last_heartbeat: DateTime::<Utc>::MIN_UTC,
                    },
                )))
            }
        }
    }

    /// One round: heartbeat if leading, observe the leader, run an election
    /// if the seat is empty or stale. Errors degrade to "no leader".
    pub async fn check_leadership(&self) {
        let mut state = self.state.lock().await;

        if self.leading.is_leader() {
            match self.heartbeat(&mut state).await {
                Ok(true) => return,
                Ok(false) => {
                    warn!(instance_id = %self.instance_id, "Leader record replaced, stepping down");
                    self.step_down(&mut state, false).await;
                }
                Err(e) => {
                    warn!(instance_id = %self.instance_id, error = %e, "Heartbeat failed, stepping down");
                    self.step_down(&mut state, true).await;
                }
            }
        }

        let observed = match self.read_leader().await {
            Ok(observed) => observed,
            Err(e) => {
                warn!(error = %e, "Cannot read leader record, assuming no leader");
                self.observe(&mut state, None).await;
                return;
            }
        };
        self.observe(&mut state, observed.as_ref().map(|(_, i)| i.clone()))
            .await;

        let stale = match &observed {
            None => true,
            Some((_, info)) => Utc::now() - info.last_heartbeat > self.election_timeout(),
        };
        if stale && let Err(e) = self.elect(&mut state, observed).await {
            warn!(instance_id = %self.instance_id, error = %e, "Election round failed");
        }
    }

    async fn observe(&self, state: &mut ElectionState, current: Option<LeaderInfo>) {
        let changed = match (&state.observed, &current) {
            (None, None) => false,
            (Some(a), Some(b)) => !a.same_reign(b),
            _ => true,
        };
        if let Some(info) = &current {
            state.term = state.term.max(info.term);
        }
        let previous = std::mem::replace(&mut state.observed, current);
        if changed {
            debug!(
                service = %self.config.service_name,
                leader = state.observed.as_ref().map(|i| i.instance_id.as_str()).unwrap_or("none"),
                "Leader changed"
            );
            for l in self.listeners.read().await.iter() {
                l.on_leader_changed(previous.as_ref(), state.observed.as_ref())
                    .await;
            }
        }
    }

    async fn highest_term_key(&self) -> Result<u64> {
        let prefix = self.key("term:");
        let keys = self
            .store
            .scan(&format!("{}*", prefix), TERM_SCAN_LIMIT)
            .await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.parse::<u64>().ok())
            .max()
            .unwrap_or(0))
    }

    async fn elect(
        &self,
        state: &mut ElectionState,
        observed: Option<(String, LeaderInfo)>,
    ) -> Result<bool> {
        let observed_term = observed.as_ref().map(|(_, i)| i.term).unwrap_or(0);
        let term = state
            .term
            .max(observed_term)
            .max(self.highest_term_key().await?)
            + 1;
        state.term = term;

        let candidacy_key = self.key(&format!("candidates:{}", self.instance_id));
        let candidacy = serde_json::json!({
            "instance_id": self.instance_id,
            "term": term,
            "at": Utc::now(),
        });
        self.store
            .set(
                &candidacy_key,
                &candidacy.to_string(),
                Some(Duration::from_millis(self.config.election_timeout_ms)),
            )
            .await?;
        debug!(instance_id = %self.instance_id, term, "Standing for election");

        tokio::time::sleep(Duration::from_millis(self.config.election_window_ms)).await;

        let won = self
            .store
            .set_if_absent(
                &self.key(&format!("term:{}", term)),
                &self.instance_id,
                Some(self.leader_ttl() * TERM_KEY_TTL_FACTOR),
            )
            .await?;
        if !won {
            debug!(instance_id = %self.instance_id, term, "Term taken by another candidate");
            return Ok(false);
        }

        let now = Utc::now();
        let info = LeaderInfo {
            service_name: self.config.service_name.clone(),
            instance_id: self.instance_id.clone(),
            term,
            elected_at: now,
            last_heartbeat: now,
        };
        let raw = serde_json::to_string(&info)?;
        let leader_key = self.leader_key();

        let mut installed = match &observed {
            Some((old, _)) => {
                self.store
                    .compare_and_set(&leader_key, old, &raw, Some(self.leader_ttl()))
                    .await?
            }
            None => false,
        };
        if !installed {
            installed = self
                .store
                .set_if_absent(&leader_key, &raw, Some(self.leader_ttl()))
                .await?;
        }
        if !installed {
            return Err(CoreError::ElectionFailed(format!(
                "won term {} but leader record changed underneath",
                term
            )));
        }

        state.own_record = Some(raw);
        self.leading.set(true);
        if let Err(e) = self.store.delete(&candidacy_key).await {
            debug!(error = %e, "Candidacy cleanup failed");
        }
        self.write_heartbeat_key().await?;
        info!(
            service = %self.config.service_name,
            instance_id = %self.instance_id,
            term,
            "Elected leader"
        );

        self.observe(state, Some(info.clone())).await;
        for l in self.listeners.read().await.iter() {
            l.on_elected(&info).await;
        }
        Ok(true)
    }

    async fn write_heartbeat_key(&self) -> Result<()> {
        self.store
            .set(
                &self.key(&format!("heartbeat:{}", self.instance_id)),
                &Utc::now().to_rfc3339(),
                Some(self.leader_ttl()),
            )
            .await
    }

    /// Ok(false) when the record no longer matches ours
    async fn heartbeat(&self, state: &mut ElectionState) -> Result<bool> {
        let Some(previous) = state.own_record.clone() else {
            return Ok(false);
        };
        let mut info: LeaderInfo = serde_json::from_str(&previous)?;
        info.last_heartbeat = Utc::now();
        let raw = serde_json::to_string(&info)?;
        if !self
            .store
            .compare_and_set(&self.leader_key(), &previous, &raw, Some(self.leader_ttl()))
            .await?
        {
            return Ok(false);
        }
        state.own_record = Some(raw);
        self.write_heartbeat_key().await?;
        debug!(term = info.term, "Leader heartbeat");
        Ok(true)
    }

    async fn step_down(&self, state: &mut ElectionState, release: bool) {
        self.leading.set(false);
        let Some(raw) = state.own_record.take() else {
            return;
        };
        if release {
            match self.store.compare_and_delete(&self.leader_key(), &raw).await {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Could not release leader record, it will expire"),
            }
        }
        if let Ok(info) = serde_json::from_str::<LeaderInfo>(&raw) {
            info!(instance_id = %self.instance_id, term = info.term, "Deposed");
            for l in self.listeners.read().await.iter() {
                l.on_deposed(&info).await;
            }
        }
    }

    /// Give up leadership voluntarily
    pub async fn resign(&self) {
        let mut state = self.state.lock().await;
        if self.leading.is_leader() {
            self.step_down(&mut state, true).await;
        }
    }

    /// Spawn the election loop
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let election = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            info!(
                service = %election.config.service_name,
                instance_id = %election.instance_id,
                "Election loop started"
            );
            loop {
                election.check_leadership().await;
                let wait = if election.is_leader() {
                    election.config.heartbeat_interval_ms
                } else {
                    election.config.check_interval_ms
                };
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    /// Stop the loop and hand leadership back
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Election loop ended abnormally");
        }
        self.resign().await;
        info!(instance_id = %self.instance_id, "Election loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinationStore;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Counter {
        elected: AtomicU32,
        deposed: AtomicU32,
        changed: AtomicU32,
    }

    #[async_trait]
    impl ElectionListener for Counter {
        async fn on_elected(&self, _info: &LeaderInfo) {
            self.elected.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_deposed(&self, _info: &LeaderInfo) {
            self.deposed.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_leader_changed(&self, _p: Option<&LeaderInfo>, _c: Option<&LeaderInfo>) {
            self.changed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            service_name: "svc".to_string(),
            heartbeat_interval_ms: 20,
            leader_ttl_ms: 1_000,
            election_timeout_ms: 60,
            election_window_ms: 10,
            check_interval_ms: 20,
        }
    }

    fn elections(store: &Arc<MemoryCoordinationStore>, n: usize) -> Vec<Arc<LeaderElection>> {
        (0..n)
            .map(|i| {
                Arc::new(LeaderElection::new(
                    store.clone(),
                    fast_config(),
                    format!("node-{}", i),
                ))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_leader_per_term() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let nodes = elections(&store, 3);

        futures::future::join_all(nodes.iter().map(|n| n.check_leadership())).await;

        let leaders: Vec<_> = nodes.iter().filter(|n| n.is_leader()).collect();
        assert_eq!(leaders.len(), 1);

        let info = nodes[0].get_leader_info().await.unwrap().unwrap();
        assert_eq!(info.instance_id, leaders[0].instance_id());
        assert_eq!(info.term, 1);

        // Everyone agrees after another round
        futures::future::join_all(nodes.iter().map(|n| n.check_leadership())).await;
        assert_eq!(nodes.iter().filter(|n| n.is_leader()).count(), 1);
        for n in &nodes {
            assert_eq!(n.term().await, 1);
        }
    }

    #[tokio::test]
    async fn test_failover_after_missed_heartbeats() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let nodes = elections(&store, 2);
        let (a, b) = (&nodes[0], &nodes[1]);
        let counter = Arc::new(Counter::default());
        a.add_listener(counter.clone()).await;

        a.check_leadership().await;
        assert!(a.is_leader());
        assert_eq!(counter.elected.load(Ordering::SeqCst), 1);

        // a goes silent past the election timeout
        tokio::time::sleep(Duration::from_millis(100)).await;
        b.check_leadership().await;
        assert!(b.is_leader());
        let info = b.get_leader_info().await.unwrap().unwrap();
        assert_eq!(info.instance_id, "node-1");
        assert_eq!(info.term, 2);

        // a notices on its next heartbeat
        a.check_leadership().await;
        assert!(!a.is_leader());
        assert_eq!(counter.deposed.load(Ordering::SeqCst), 1);
        assert!(counter.changed.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_heartbeat_error_steps_down() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let nodes = elections(&store, 1);
        let counter = Arc::new(Counter::default());
        nodes[0].add_listener(counter.clone()).await;

        nodes[0].check_leadership().await;
        assert!(nodes[0].is_leader());

        store.set_available(false);
        nodes[0].check_leadership().await;
        assert!(!nodes[0].is_leader());
        assert_eq!(counter.deposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resign_releases_seat() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let nodes = elections(&store, 2);
        nodes[0].check_leadership().await;
        nodes[0].resign().await;
        assert!(nodes[0].get_leader_info().await.unwrap().is_none());

        nodes[1].check_leadership().await;
        assert!(nodes[1].is_leader());
        assert_eq!(nodes[1].get_leader_info().await.unwrap().unwrap().term, 2);
    }

    #[tokio::test]
    async fn test_start_stop_loop() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let nodes = elections(&store, 1);
        nodes[0].start().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(nodes[0].is_leader());
        nodes[0].stop().await;
        assert!(!nodes[0].is_leader());
        assert!(store.get("leader_election:svc:leader").await.unwrap().is_none());
    }
}
