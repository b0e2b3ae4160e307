//! Delegation coordinator.
//!
//! Tracks every agent-to-agent request as a record that always reaches a
//! terminal status. Chains run sequentially (each link sees the previous
//! result, failures short-circuit) or in parallel (one aggregated report).
//! `delegate` never blocks the origin's turn; completion comes back later
//! as a report turn injected into the origin session.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use async_trait::async_trait;

use crate::actions::{ActionHandler, DispatchContext};
use crate::agent::session::{TurnInput, TurnOrigin, TurnStatus};
use crate::error::EngineError;
use crate::supervisor::{Scope, SessionKey, Supervisor};

/// How a multi-target delegation is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    Single,
    Sequential,
    Parallel,
}

/// Terminal-or-pending state of one delegation record.
#[derive(Debug, Clone, PartialEq)]
pub enum DelegationStatus {
    Pending,
    Completed,
    Failed(EngineError),
}

/// One tracked agent-to-agent request.
#[derive(Debug)]
pub struct DelegationRecord {
    pub id: String,
    pub chain_id: String,
    pub from: SessionKey,
    pub to: SessionKey,
    pub status: DelegationStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    cancel: tokio_util::sync::CancellationToken,
}

#[derive(Debug, Clone)]
pub struct DelegationConfig {
    /// Per-link deadline. A link that sees no terminal outcome within it
    /// fails with `DelegationTimeout` and the target turn is cancelled.
    pub deadline: Duration,
    /// Parallel chains only: deliver the report at the first failure
    /// instead of waiting for every sibling. Siblings still run to a
    /// terminal status either way.
    pub fail_fast: bool,
    /// Settled chains kept for status queries. The ledger prunes the
    /// oldest settled chain's records past this count.
    pub retained_chains: usize,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            fail_fast: false,
            retained_chains: 64,
        }
    }
}

/// One target of a delegation request. Without `project_id` the target
/// resolves in the origin's scope; with it, in that project. Both go
/// through the same supervisor, so cross-project delegation has no
/// separate path.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationTarget {
    pub agent_id: String,
    pub task: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegationRequest {
    pub mode: ChainKind,
    pub agents: Vec<DelegationTarget>,
}

/// Tracks delegation records and drives chains to completion.
pub struct DelegationCoordinator {
    records: DashMap<String, DelegationRecord>,
    /// Settled chain ids in completion order, oldest first.
    settled: parking_lot::Mutex<std::collections::VecDeque<String>>,
    supervisor: Arc<Supervisor>,
    config: DelegationConfig,
}

impl DelegationCoordinator {
    pub fn new(supervisor: Arc<Supervisor>, config: DelegationConfig) -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            settled: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            supervisor,
            config,
        })
    }

    /// Accept a delegation request and return its chain id immediately.
    /// Execution happens on a spawned chain task.
    pub fn delegate(
        self: &Arc<Self>,
        origin: SessionKey,
        request: DelegationRequest,
    ) -> Result<String, EngineError> {
        if request.agents.is_empty() {
            return Err(EngineError::InvalidInput(
                "delegation requires at least one target".to_string(),
            ));
        }
        if request.mode == ChainKind::Single && request.agents.len() != 1 {
            return Err(EngineError::InvalidInput(format!(
                "single mode takes exactly one target, got {}",
                request.agents.len()
            )));
        }

        let chain_id = Uuid::new_v4().to_string();
        let mut links = Vec::with_capacity(request.agents.len());
        for target in &request.agents {
            let scope = match &target.project_id {
                Some(project) => Scope::project(project.clone()),
                None => origin.scope.clone(),
            };
            let to = SessionKey::new(scope, target.agent_id.clone());
            if to == origin {
                return Err(EngineError::InvalidInput(
                    "cannot delegate to the requesting session".to_string(),
                ));
            }
            let record_id = Uuid::new_v4().to_string();
            self.records.insert(
                record_id.clone(),
                DelegationRecord {
                    id: record_id.clone(),
                    chain_id: chain_id.clone(),
                    from: origin.clone(),
                    to: to.clone(),
                    status: DelegationStatus::Pending,
                    created_at: chrono::Utc::now(),
                    cancel: tokio_util::sync::CancellationToken::new(),
                },
            );
            links.push(ChainLink {
                record_id,
                to,
                task: target.task.clone(),
            });
        }

        info!(
            chain = %chain_id,
            origin = %origin,
            mode = ?request.mode,
            targets = links.len(),
            "delegation accepted"
        );

        let coordinator = Arc::clone(self);
        let chain = chain_id.clone();
        tokio::spawn(async move {
            coordinator.run_chain(chain, origin, request.mode, links).await;
        });

        Ok(chain_id)
    }

    pub fn record_status(&self, record_id: &str) -> Option<DelegationStatus> {
        self.records.get(record_id).map(|r| r.status.clone())
    }

    /// Record statuses for one chain, keyed by target agent id.
    pub fn chain_statuses(&self, chain_id: &str) -> Vec<(String, DelegationStatus)> {
        self.records
            .iter()
            .filter(|r| r.chain_id == chain_id)
            .map(|r| (r.to.agent_id.clone(), r.status.clone()))
            .collect()
    }

    /// Scope teardown: every pending record that originates from or
    /// targets the scope fails with `ScopeTornDown` and its link is
    /// cancelled.
    pub fn fail_scope(&self, scope: &Scope) {
        let mut failed = 0;
        for mut record in self.records.iter_mut() {
            let in_scope = record.from.scope == *scope || record.to.scope == *scope;
            if in_scope && record.status == DelegationStatus::Pending {
                record.status = DelegationStatus::Failed(EngineError::ScopeTornDown);
                record.cancel.cancel();
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(scope = %scope, failed, "pending delegations failed by scope teardown");
        }
    }

    #[instrument(skip_all, fields(chain = %chain_id, origin = %origin))]
    async fn run_chain(
        self: Arc<Self>,
        chain_id: String,
        origin: SessionKey,
        mode: ChainKind,
        links: Vec<ChainLink>,
    ) {
        match mode {
            ChainKind::Single | ChainKind::Sequential => {
                let results = self.run_sequential(links).await;
                self.report_to_origin(&origin, &chain_report(&chain_id, &results, &[]));
            }
            ChainKind::Parallel => {
                self.run_parallel(&chain_id, &origin, links).await;
            }
        }
        self.retire_chain(&chain_id);
        debug!("chain finished");
    }

    /// Record the chain as settled and prune the oldest settled chain's
    /// records once the retention cap is exceeded.
    fn retire_chain(&self, chain_id: &str) {
        let evicted = {
            let mut settled = self.settled.lock();
            settled.push_back(chain_id.to_string());
            if settled.len() > self.config.retained_chains {
                settled.pop_front()
            } else {
                None
            }
        };
        if let Some(old) = evicted {
            self.records.retain(|_, record| record.chain_id != old);
        }
    }

    /// Run links in order, feeding each result into the next task. The
    /// first failure short-circuits; the remaining records fail with the
    /// same error without running.
    async fn run_sequential(&self, links: Vec<ChainLink>) -> Vec<LinkResult> {
        let mut results = Vec::with_capacity(links.len());
        let mut short_circuit: Option<EngineError> = None;
        let mut previous: Option<String> = None;

        for link in links {
            if let Some(e) = &short_circuit {
                self.finish_record(&link.record_id, &Err(e.clone()));
                results.push(LinkResult {
                    agent_id: link.to.agent_id,
                    result: Err(e.clone()),
                });
                continue;
            }

            let task = match &previous {
                Some(prev) => format!("{}\n\nResult from the previous step:\n{}", link.task, prev),
                None => link.task.clone(),
            };
            let result = self.run_link(&link.record_id, link.to.clone(), task).await;
            match &result {
                Ok(text) => previous = Some(text.clone()),
                Err(e) => short_circuit = Some(e.clone()),
            }
            results.push(LinkResult {
                agent_id: link.to.agent_id,
                result,
            });
        }

        results
    }

    /// Run links concurrently. Every link reaches a terminal status; with
    /// fail-fast, the report goes out at the first failure while the
    /// remaining links keep running.
    async fn run_parallel(
        self: &Arc<Self>,
        chain_id: &str,
        origin: &SessionKey,
        links: Vec<ChainLink>,
    ) {
        let total = links.len();
        let (tx, mut rx) = mpsc::unbounded_channel::<LinkResult>();

        for link in links {
            let coordinator = Arc::clone(self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = coordinator
                    .run_link(&link.record_id, link.to.clone(), link.task)
                    .await;
                let _ = tx.send(LinkResult {
                    agent_id: link.to.agent_id,
                    result,
                });
            });
        }
        drop(tx);

        let mut results: Vec<LinkResult> = Vec::with_capacity(total);
        let mut reported = false;
        while let Some(link_result) = rx.recv().await {
            let failed = link_result.result.is_err();
            results.push(link_result);

            if self.config.fail_fast && failed && !reported && results.len() < total {
                let pending: Vec<String> = self
                    .chain_statuses(chain_id)
                    .into_iter()
                    .filter(|(_, status)| *status == DelegationStatus::Pending)
                    .map(|(agent, _)| agent)
                    .collect();
                self.report_to_origin(origin, &chain_report(chain_id, &results, &pending));
                reported = true;
            }
        }

        if !reported {
            self.report_to_origin(origin, &chain_report(chain_id, &results, &[]));
        }
    }

    /// Execute one link against its target session and settle the record.
    async fn run_link(
        &self,
        record_id: &str,
        to: SessionKey,
        task: String,
    ) -> Result<String, EngineError> {
        let cancel = match self.records.get(record_id) {
            Some(record) => record.cancel.clone(),
            None => return Err(EngineError::ScopeTornDown),
        };

        let result = async {
            let (handle, ack) = self
                .supervisor
                .route_with_ack(to.clone(), TurnInput::delegation(task))?;

            tokio::select! {
                _ = cancel.cancelled() => {
                    handle.cancel_turn();
                    Err(EngineError::ScopeTornDown)
                }
                acked = tokio::time::timeout(self.config.deadline, ack) => match acked {
                    Err(_) => {
                        warn!(target = %to, "delegation link deadline exceeded");
                        handle.cancel_turn();
                        Err(EngineError::DelegationTimeout(self.config.deadline))
                    }
                    // Target torn down before the turn settled.
                    Ok(Err(_)) => Err(EngineError::ScopeTornDown),
                    Ok(Ok(outcome)) => match outcome.status {
                        TurnStatus::Completed => Ok(outcome.text),
                        TurnStatus::Cancelled => Err(EngineError::ScopeTornDown),
                        TurnStatus::Failed(e) => Err(e),
                    },
                },
            }
        }
        .await;

        self.finish_record(record_id, &result);
        result
    }

    fn finish_record(&self, record_id: &str, result: &Result<String, EngineError>) {
        if let Some(mut record) = self.records.get_mut(record_id) {
            // fail_scope may have settled it first; terminal status is final.
            if record.status != DelegationStatus::Pending {
                return;
            }
            record.status = match result {
                Ok(_) => DelegationStatus::Completed,
                Err(e) => DelegationStatus::Failed(e.clone()),
            };
        }
    }

    /// Inject the chain report into the origin session as a report turn.
    /// A stopped origin drops the report; sessions are never recreated
    /// just to receive one.
    fn report_to_origin(&self, origin: &SessionKey, report: &str) {
        match self.supervisor.get(origin) {
            Some(handle) => {
                let sent = handle.send_turn(TurnInput {
                    text: report.to_string(),
                    origin: TurnOrigin::DelegationReport,
                });
                if sent.is_err() {
                    debug!(origin = %origin, "origin gone, report dropped");
                }
            }
            None => debug!(origin = %origin, "origin not running, report dropped"),
        }
    }
}

struct ChainLink {
    record_id: String,
    to: SessionKey,
    task: String,
}

struct LinkResult {
    agent_id: String,
    result: Result<String, EngineError>,
}

/// Human-readable chain report fed to the origin's model.
fn chain_report(chain_id: &str, results: &[LinkResult], pending: &[String]) -> String {
    let mut report = format!("Delegation chain {} results:\n", chain_id);
    for link in results {
        match &link.result {
            Ok(text) => report.push_str(&format!("- {}: ok: {}\n", link.agent_id, text)),
            Err(e) => report.push_str(&format!(
                "- {}: failed ({}): {}\n",
                link.agent_id,
                e.code(),
                e
            )),
        }
    }
    for agent in pending {
        report.push_str(&format!("- {}: still running\n", agent));
    }
    report
}

/// The `agents__delegate` infra action. Bound to the coordinator after
/// construction because the coordinator itself needs the registry's router.
pub struct DelegateHandler {
    coordinator: OnceCell<Arc<DelegationCoordinator>>,
}

impl DelegateHandler {
    pub const NODE: &'static str = "agents";
    pub const ACTION: &'static str = "delegate";

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            coordinator: OnceCell::new(),
        })
    }

    pub fn bind(&self, coordinator: Arc<DelegationCoordinator>) {
        // A second bind is a wiring bug; the first one wins.
        let _ = self.coordinator.set(coordinator);
    }

    pub fn description() -> &'static str {
        "Delegate tasks to other agents. Results are reported back when the chain finishes."
    }

    pub fn input_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {
                    "type": "string",
                    "enum": ["single", "sequential", "parallel"],
                    "description": "How to run multiple targets."
                },
                "agents": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "agent_id": {"type": "string"},
                            "task": {"type": "string"},
                            "project_id": {
                                "type": "string",
                                "description": "Target project; defaults to the caller's scope."
                            }
                        },
                        "required": ["agent_id", "task"]
                    }
                }
            },
            "required": ["mode", "agents"]
        })
    }
}

#[async_trait]
impl ActionHandler for DelegateHandler {
    async fn handle(&self, params: Value, ctx: &DispatchContext) -> Result<Value, EngineError> {
        let coordinator = self
            .coordinator
            .get()
            .ok_or_else(|| EngineError::provider("delegation not wired", false))?;
        let request: DelegationRequest = serde_json::from_value(params)
            .map_err(|e| EngineError::InvalidInput(format!("bad delegation request: {}", e)))?;
        let targets = request.agents.len();
        let chain_id = coordinator.delegate(ctx.session.clone(), request)?;
        Ok(json!({
            "chain_id": chain_id,
            "accepted": true,
            "targets": targets,
        }))
    }
}
