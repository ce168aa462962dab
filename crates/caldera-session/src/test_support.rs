//! Shared fixtures for manager and monitor tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caldera_billing::BillingEngine;
use caldera_common::config::{CalderaConfig, MonitorConfig};
use caldera_common::error::{Error, Result};
use caldera_common::types::{
    CreditBalance, ProviderKind, SessionStatus, UserId, UserType, WorkspaceId,
};
use caldera_provider::{
    ExecHandle, ExecOutcome, ExecResult, ProviderDriver, SessionInfo, SessionRequest, ShellFrame,
    ShellLimits, ShellStream, ShellSupervisor,
};
use caldera_store::{NewUser, Store};
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};

use crate::manager::SessionManager;
use crate::monitor::{KillNotification, SessionMonitor};
use crate::templates::TemplateRegistry;

/// In-memory driver: sessions live in a map, execs echo, shells echo.
/// `remove` simulates a backend losing the session out-of-band.
pub struct FakeDriver {
    kind: ProviderKind,
    pub sessions: Arc<RwLock<HashMap<String, SessionInfo>>>,
}

impl FakeDriver {
    pub fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }
}

#[async_trait]
impl ProviderDriver for FakeDriver {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn create(&self, req: &SessionRequest) -> Result<SessionInfo> {
        let session_id = req
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));

        let info = SessionInfo {
            id: session_id.clone(),
            provider: self.kind,
            workspace_id: req.workspace_id.clone(),
            user: req.user.clone(),
            namespace: req.namespace.clone(),
            status: SessionStatus::Running,
            url: Some(format!("https://{session_id}.example")),
            websocket: None,
            created_at: Utc::now(),
            storage_config: serde_json::json!({}),
            details: HashMap::from([(
                "ttl_minutes".to_string(),
                req.ttl_minutes.to_string(),
            )]),
        };

        self.sessions
            .write()
            .await
            .insert(session_id, info.clone());
        Ok(info)
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn execute(
        &self,
        session_id: &str,
        command: &str,
        _timeout: Duration,
        async_execution: bool,
    ) -> Result<ExecOutcome> {
        if !self.contains(session_id).await {
            return Err(Error::not_found(format!("session {session_id}")));
        }

        if async_execution {
            Ok(ExecOutcome::Submitted(ExecHandle {
                session_id: session_id.to_string(),
                job_id: format!("job-{}", uuid::Uuid::new_v4()),
                job_name: format!("job-{session_id}"),
            }))
        } else {
            Ok(ExecOutcome::Completed(ExecResult::ok(command)))
        }
    }

    async fn get_job_status(&self, handle: &ExecHandle) -> Result<Option<ExecResult>> {
        Ok(Some(ExecResult::ok(format!("job {} done", handle.job_id))))
    }

    async fn open_shell(&self, session_id: &str) -> Result<ShellStream> {
        if !self.contains(session_id).await {
            return Err(Error::not_found(format!("session {session_id}")));
        }

        let (client_end, mut session_end) = ShellStream::pair(16);
        tokio::spawn(async move {
            while let Some(frame) = session_end.rx.recv().await {
                if let ShellFrame::Stdin(line) = frame {
                    if session_end.tx.send(ShellFrame::Stdout(line)).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(client_end)
    }
}

pub struct Harness {
    pub store: Arc<Store>,
    pub billing: Arc<BillingEngine>,
    pub templates: Arc<TemplateRegistry>,
    pub jobs: Arc<FakeDriver>,
    pub pods: Arc<FakeDriver>,
    pub manager: Arc<SessionManager>,
}

impl Harness {
    /// Store + billing + fake drivers + manager, seeded with user `alice`
    /// (pro tier) and workspace `ws-1`.
    pub async fn new(credits: f64) -> Self {
        let store = Arc::new(Store::for_testing().await.unwrap());
        store
            .create_user(NewUser {
                user_id: UserId::new("alice"),
                email: "alice@example.com".to_string(),
                name: "alice".to_string(),
                user_type: UserType::Pro,
                initial_credits: CreditBalance::from_f64(credits).unwrap(),
            })
            .await
            .unwrap();
        store
            .create_workspace(
                &WorkspaceId::new("ws-1"),
                &UserId::new("alice"),
                "scratch",
                "small",
                None,
            )
            .await
            .unwrap();

        let billing = Arc::new(BillingEngine::new(
            store.clone(),
            CalderaConfig::default().billing,
        ));
        let templates = Arc::new(TemplateRegistry::new());
        let jobs = FakeDriver::new(ProviderKind::Jobs);
        let pods = FakeDriver::new(ProviderKind::Pods);

        let (shell_closed_tx, _shell_closed_rx) = mpsc::channel(16);
        let shell_supervisor = Arc::new(ShellSupervisor::new(
            ShellLimits::default(),
            shell_closed_tx,
        ));

        let manager = Arc::new(SessionManager::new(
            store.clone(),
            billing.clone(),
            templates.clone(),
            jobs.clone(),
            pods.clone(),
            shell_supervisor,
        ));

        Self {
            store,
            billing,
            templates,
            jobs,
            pods,
            manager,
        }
    }

    pub fn request(&self) -> SessionRequest {
        SessionRequest::new("ws-1", "ns-1", "alice")
    }

    /// Monitor with fast-friendly limits for tests
    pub fn monitor(
        &self,
        config: MonitorConfig,
    ) -> (SessionMonitor, mpsc::Receiver<KillNotification>) {
        let (notify_tx, notify_rx) = mpsc::channel(16);
        let monitor = SessionMonitor::new(
            self.store.clone(),
            self.billing.clone(),
            self.manager.clone(),
            config,
            notify_tx,
        );
        (monitor, notify_rx)
    }
}

/// Monitor limits that never skip sessions for youth
pub fn eager_monitor_config() -> MonitorConfig {
    MonitorConfig {
        max_duration_hours: 48.0,
        max_cost_usd: 500.0,
        check_interval_minutes: 30,
        min_session_age_minutes: 0,
        grace_period_minutes: 0,
        low_credit_runway_factor: 0.1,
    }
}

/// Shift a billing row's start time into the past
pub async fn backdate_billing(store: &Store, session_id: &str, seconds: i64) {
    let backdated = (Utc::now() - chrono::Duration::seconds(seconds)).to_rfc3339();
    sqlx::query("UPDATE session_billing SET start_time = ? WHERE session_id = ?")
        .bind(backdated)
        .bind(session_id)
        .execute(store.pool())
        .await
        .unwrap();
}
