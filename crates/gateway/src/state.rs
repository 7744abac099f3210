use std::sync::Arc;
use std::time::Duration;

use studio_domain::config::Config;
use studio_domain::error::Result;
use studio_store::{
    AgentSessionStore, ConversationStore, ForensicsKv, MessageStore, PlanStore,
};

use crate::runtime::broadcast::BroadcastAdapter;
use crate::runtime::filter::ToolDisplayFilter;
use crate::runtime::projector::PlanProjector;
use crate::runtime::reply::ReplyRegistry;
use crate::runtime::supervisor::Supervisor;
use crate::sockets::SocketHub;

/// Shared application state passed to all API handlers.
///
/// Fields are grouped by concern:
/// - **Core** — config
/// - **Durable stores** — conversations, messages, agent sessions, plans,
///   forensics
/// - **Runtime** — reply registry, supervisor, projector, tool filter
/// - **Socket bus** — hub + broadcast adapter
/// - **Security** — token hashes computed once at startup
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,

    // ── Durable stores ────────────────────────────────────────────────
    pub conversations: Arc<ConversationStore>,
    pub messages: Arc<MessageStore>,
    pub agent_sessions: Arc<AgentSessionStore>,
    pub plans: Arc<PlanStore>,
    /// Short-lived `agent:reply:{id}` snapshots for crash forensics.
    pub forensics: Arc<ForensicsKv>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub replies: Arc<ReplyRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub projector: Arc<PlanProjector>,
    pub tool_filter: Arc<ToolDisplayFilter>,

    // ── Socket bus ────────────────────────────────────────────────────
    pub sockets: Arc<SocketHub>,
    pub broadcast: Arc<BroadcastAdapter>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token. `None` = dev mode.
    pub api_token_hash: Option<Vec<u8>>,
    /// SHA-256 hash of the agent callback secret. `None` = open callbacks.
    pub callback_token_hash: Option<Vec<u8>>,
}

impl AppState {
    /// Construct every service once from the config. Token hashes start
    /// as `None`; `run_server` fills them in from the environment.
    pub fn from_config(config: Arc<Config>) -> Result<Self> {
        let state_path = &config.storage.state_path;

        let conversations = Arc::new(ConversationStore::new(state_path)?);
        let messages = Arc::new(MessageStore::new(state_path)?);
        let agent_sessions = Arc::new(AgentSessionStore::new(state_path));
        let plans = Arc::new(PlanStore::new(state_path)?);
        let forensics = Arc::new(ForensicsKv::new(Duration::from_secs(
            config.lifecycle.forensics_ttl_secs,
        )));

        let replies = Arc::new(ReplyRegistry::new(config.stream.subscriber_buffer));
        let supervisor = Arc::new(Supervisor::new());
        let projector = Arc::new(PlanProjector::new(plans.clone()));
        let tool_filter = Arc::new(ToolDisplayFilter::from_config(&config.agent.tools));

        let sockets = Arc::new(SocketHub::new());
        let broadcast = Arc::new(BroadcastAdapter::new(sockets.clone()));

        Ok(Self {
            config,
            conversations,
            messages,
            agent_sessions,
            plans,
            forensics,
            replies,
            supervisor,
            projector,
            tool_filter,
            sockets,
            broadcast,
            api_token_hash: None,
            callback_token_hash: None,
        })
    }
}
