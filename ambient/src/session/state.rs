// In-memory session record owned by the daemon
//
// All mutation goes through `SessionStore`, which serializes updates behind a
// single async mutex. Replacing a session swaps in a fresh record and bumps the
// generation, so queries still running against the old record are not counted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub agent_name: String,
    pub query_count: u64,
    pub last_response: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl SessionState {
    pub fn new(agent_name: impl Into<String>, cwd: Option<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            query_count: 0,
            last_response: String::new(),
            started_at: Utc::now(),
            cwd,
        }
    }
}

/// What a query needs to know about the session before it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTicket {
    pub agent_name: String,
    /// The session already talked to this agent, so continuation args apply
    pub continues: bool,
    generation: u64,
}

#[derive(Debug, Default)]
struct Slot {
    session: Option<SessionState>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct SessionStore {
    current: Mutex<Slot>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard the current session and start a new one
    pub async fn replace(&self, agent_name: &str, cwd: Option<String>) -> SessionState {
        let fresh = SessionState::new(agent_name, cwd);
        let mut slot = self.current.lock().await;
        slot.generation += 1;
        slot.session = Some(fresh.clone());
        fresh
    }

    /// Resolve the agent for a query, creating the session if absent.
    ///
    /// `requested` wins over the session's agent, which wins over `default_agent`.
    /// Switching agents updates the session's current agent.
    pub async fn begin_query(
        &self,
        requested: Option<&str>,
        default_agent: &str,
        cwd: &str,
    ) -> QueryTicket {
        let mut slot = self.current.lock().await;
        let generation = slot.generation;
        let session = slot.session.get_or_insert_with(|| {
            SessionState::new(requested.unwrap_or(default_agent), Some(cwd.to_string()))
        });

        let agent_name = requested.unwrap_or(session.agent_name.as_str()).to_string();
        let continues = session.query_count > 0 && session.agent_name == agent_name;
        session.agent_name = agent_name.clone();

        QueryTicket {
            agent_name,
            continues,
            generation,
        }
    }

    /// Record a finished query attempt, successful or not.
    ///
    /// Returns false, leaving the store untouched, when the session the query
    /// began in has since been replaced.
    pub async fn complete_query(&self, ticket: &QueryTicket, response: String) -> bool {
        let mut slot = self.current.lock().await;
        if slot.generation != ticket.generation {
            return false;
        }
        match slot.session.as_mut() {
            Some(session) => {
                session.query_count += 1;
                session.last_response = response;
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> Option<SessionState> {
        self.current.lock().await.session.clone()
    }
}
