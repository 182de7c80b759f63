//! Shared daemon state.
//!
//! The daemon process exclusively owns the registries, pending-decision
//! map, learned-rule cache and evaluator handle for its lifetime. Each
//! in-memory map gets its own coarse lock; files are append-only or
//! single-writer per session.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use marvel_core::paths::ProjectPaths;
use marvel_packs::{InjectionDedup, PackStore};
use marvel_security::{
    BashGate, CommandEvaluator, LearnedRuleStore, PendingDecisionTracker, RuleSets,
};
use marvel_session::{AgentRegistry, RunStore, SessionState, SessionStateStore};

use crate::config::SecurityConfig;

/// Result of the once-per-daemon session initialization: loaded packs
/// and the run directory. Shared read-only after first session-start.
pub struct SessionInit {
    pub packs: PackStore,
    pub run: Mutex<RunStore>,
}

/// Per-session context the handlers update between hooks.
#[derive(Debug, Clone, Default)]
pub struct PrecedingContext {
    pub file: Option<String>,
    pub tool: Option<String>,
}

pub struct DaemonState {
    pub paths: ProjectPaths,
    pub config: SecurityConfig,

    pub active_sessions: Mutex<HashSet<String>>,
    init: Mutex<Option<Arc<SessionInit>>>,

    pub gate: Arc<BashGate>,
    pub pending: Arc<PendingDecisionTracker>,
    pub evaluator: Arc<dyn CommandEvaluator>,
    pub registry: Arc<AgentRegistry>,
    pub dedup: Mutex<InjectionDedup>,

    sessions: Mutex<HashMap<String, SessionState>>,
    preceding: Mutex<HashMap<String, PrecedingContext>>,

    shutdown_tx: watch::Sender<bool>,
}

impl DaemonState {
    pub fn new(
        project_root: PathBuf,
        config: SecurityConfig,
        evaluator: Arc<dyn CommandEvaluator>,
    ) -> Arc<Self> {
        let paths = ProjectPaths::new(project_root.clone());
        let security_dir = paths.security_dir();

        let pending = Arc::new(PendingDecisionTracker::new());
        let gate = Arc::new(BashGate::new(
            RuleSets::load(&security_dir),
            LearnedRuleStore::new(&security_dir),
            Arc::clone(&pending),
            Arc::clone(&evaluator),
            project_root.to_string_lossy().to_string(),
            security_dir,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            paths,
            config,
            active_sessions: Mutex::new(HashSet::new()),
            init: Mutex::new(None),
            gate,
            pending,
            evaluator,
            registry: Arc::new(AgentRegistry::new()),
            dedup: Mutex::new(InjectionDedup::new()),
            sessions: Mutex::new(HashMap::new()),
            preceding: Mutex::new(HashMap::new()),
            shutdown_tx,
        })
    }

    /// First caller performs the full init; concurrent callers share the
    /// result through the lock. Idempotent per empty-to-nonempty
    /// transition.
    pub async fn init_session(&self) -> std::io::Result<Arc<SessionInit>> {
        let mut init = self.init.lock().await;
        if let Some(existing) = init.as_ref() {
            return Ok(Arc::clone(existing));
        }

        info!("initializing session state for project");
        let packs = PackStore::load(&self.paths.packs_dir());
        let run = RunStore::create(&self.paths.runs_dir(), packs.names())?;

        let created = Arc::new(SessionInit {
            packs,
            run: Mutex::new(run),
        });
        *init = Some(Arc::clone(&created));
        Ok(created)
    }

    /// Cached init result, when a session already ran the full init.
    pub async fn current_init(&self) -> Option<Arc<SessionInit>> {
        self.init.lock().await.clone()
    }

    /// Crash recovery: a session-start into an empty set clears any
    /// stale cache from prior activity.
    pub async fn clear_init_cache(&self) {
        let mut init = self.init.lock().await;
        if init.take().is_some() {
            debug!("cleared stale session init cache");
        }
    }

    pub fn session_store(&self, session_id: &str) -> SessionStateStore {
        SessionStateStore::new(self.paths.session_state_path(session_id))
    }

    /// In-memory session state, loading from disk on first touch.
    pub async fn session_state(&self, session_id: &str) -> SessionState {
        let mut sessions = self.sessions.lock().await;
        if let Some(state) = sessions.get(session_id) {
            return state.clone();
        }
        let state = self.session_store(session_id).load(session_id);
        sessions.insert(session_id.to_string(), state.clone());
        state
    }

    pub async fn update_session_state(&self, state: SessionState) {
        self.session_store(&state.session_id).save(&state);
        self.sessions
            .lock()
            .await
            .insert(state.session_id.clone(), state);
    }

    pub async fn drop_session_state(&self, session_id: &str) {
        self.sessions.lock().await.remove(session_id);
        self.preceding.lock().await.remove(session_id);
    }

    pub async fn preceding_context(&self, session_id: &str) -> PrecedingContext {
        self.preceding
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_preceding_context(&self, session_id: &str, file: Option<String>, tool: Option<String>) {
        let mut preceding = self.preceding.lock().await;
        let entry = preceding.entry(session_id.to_string()).or_default();
        if file.is_some() {
            entry.file = file;
        }
        if tool.is_some() {
            entry.tool = tool;
        }
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
