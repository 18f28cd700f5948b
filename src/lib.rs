pub mod canonical;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feedback;
pub mod ipc;
pub mod ledger;
pub mod limiter;
pub mod nodes;
pub mod policy;
pub mod shell;

use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use config::{KernelConfig, KernelEnv};
use dispatch::Dispatcher;
use feedback::FeedbackTracker;
use ipc::event::EventBroadcaster;
use ledger::Ledger;
use limiter::{ActionLimiter, LimiterConfig};
use nodes::front::NodeFront;
use nodes::{Exposure, NodeRegistry};
use policy::approval::{ApprovalManager, DEFAULT_TOKEN_TTL};
use policy::{Gate, PolicyStore, VerifyOptions};

/// Everything long-lived, wired once at startup and threaded through RPC
/// and tool plumbing. No globals.
pub struct Kernel {
    pub config: Arc<KernelConfig>,
    pub env: KernelEnv,
    pub policy_store: Arc<PolicyStore>,
    pub approvals: Arc<ApprovalManager>,
    pub limiter: Arc<ActionLimiter>,
    pub feedback: Arc<FeedbackTracker>,
    pub ledger: Arc<Ledger>,
    pub dangerous_ledger: Arc<Ledger>,
    pub gate: Arc<Gate>,
    pub dispatcher: Arc<Dispatcher>,
    pub nodes: Arc<NodeRegistry>,
    pub front: Arc<NodeFront>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub started_at: Instant,
    /// Local WebSocket auth token. Every new connection must send a
    /// `kernel.auth` RPC with this token before any other method call.
    /// Empty string means auth is disabled (not recommended).
    pub auth_token: String,
}

impl Kernel {
    /// Wire up the kernel. The initial policy load is best-effort: a broken
    /// file leaves no policy installed and dispatch fails closed according
    /// to the configured signed-policy requirements.
    pub fn new(
        config: KernelConfig,
        env: KernelEnv,
        exposure: Exposure,
        auth_token: String,
    ) -> Arc<Kernel> {
        let config = Arc::new(config);

        let policy_store = Arc::new(PolicyStore::new(VerifyOptions {
            verify: env.verify_policy,
            require_signed: env.require_signed_policy,
            public_key_pem: env.policy_pubkey.clone(),
        }));
        if env.policy_path.is_some() || env.verify_policy {
            if let Err(e) = policy_store.load_configured(env.policy_path.as_deref()) {
                warn!(err = %e, "initial policy load failed — continuing without");
            }
        }

        let feedback = Arc::new(FeedbackTracker::new(config.adaptive_risk));
        let gate = Arc::new(Gate::new(Arc::clone(&feedback)));
        let ledger = Arc::new(Ledger::new(config.ledger_dir()));
        let dangerous_ledger = Arc::new(Ledger::new(config.dangerous_ledger_dir()));
        let limiter = Arc::new(ActionLimiter::new(LimiterConfig {
            global_slots: config.dangerous_slots,
            ..Default::default()
        }));
        let approvals = Arc::new(ApprovalManager::new(DEFAULT_TOKEN_TTL));
        let nodes = Arc::new(NodeRegistry::new());
        let broadcaster = Arc::new(EventBroadcaster::new());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&policy_store),
            Arc::clone(&gate),
            Arc::clone(&ledger),
            Arc::clone(&feedback),
            env.clone(),
        ));
        let front = Arc::new(NodeFront::new(
            Arc::clone(&nodes),
            Arc::clone(&limiter),
            Arc::clone(&approvals),
            Arc::clone(&dangerous_ledger),
            env.clone(),
            exposure,
            config.workspace_dir.clone(),
        ));

        Arc::new(Kernel {
            config,
            env,
            policy_store,
            approvals,
            limiter,
            feedback,
            ledger,
            dangerous_ledger,
            gate,
            dispatcher,
            nodes,
            front,
            broadcaster,
            started_at: Instant::now(),
            auth_token,
        })
    }
}
