//! End-to-end flow over the public API: purchase credits, run a session,
//! settle billing, reap orphans.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caldera_billing::BillingEngine;
use caldera_common::config::CalderaConfig;
use caldera_common::error::{Error, Result};
use caldera_common::types::{
    BillingStatus, CreditBalance, ProviderKind, ResourceTier, SessionStatus, UserId, UserType,
    WorkspaceId,
};
use caldera_provider::{
    ExecHandle, ExecOutcome, ExecResult, ProviderDriver, SessionInfo, SessionRequest, ShellLimits,
    ShellStream, ShellSupervisor,
};
use caldera_session::{SessionManager, TemplateRegistry};
use caldera_store::{NewUser, Store};
use chrono::Utc;
use rust_decimal_macros::dec;
use tokio::sync::{mpsc, RwLock};

/// Minimal in-memory driver for exercising the manager end to end
struct MapDriver {
    kind: ProviderKind,
    sessions: Arc<RwLock<HashMap<String, SessionInfo>>>,
}

impl MapDriver {
    fn new(kind: ProviderKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl ProviderDriver for MapDriver {
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
            url: None,
            websocket: None,
            created_at: Utc::now(),
            storage_config: serde_json::json!({}),
            details: HashMap::new(),
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
        _async_execution: bool,
    ) -> Result<ExecOutcome> {
        if !self.sessions.read().await.contains_key(session_id) {
            return Err(Error::not_found(format!("session {session_id}")));
        }
        Ok(ExecOutcome::Completed(ExecResult::ok(command)))
    }

    async fn get_job_status(&self, _handle: &ExecHandle) -> Result<Option<ExecResult>> {
        Ok(Some(ExecResult::ok("done")))
    }

    async fn open_shell(&self, _session_id: &str) -> Result<ShellStream> {
        let (client_end, _session_end) = ShellStream::pair(4);
        Ok(client_end)
    }
}

struct World {
    store: Arc<Store>,
    billing: Arc<BillingEngine>,
    manager: Arc<SessionManager>,
}

async fn world() -> World {
    let store = Arc::new(Store::for_testing().await.unwrap());
    let billing = Arc::new(BillingEngine::new(
        store.clone(),
        CalderaConfig::default().billing,
    ));
    let (shell_closed_tx, _shell_closed_rx) = mpsc::channel(4);
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        billing.clone(),
        Arc::new(TemplateRegistry::new()),
        MapDriver::new(ProviderKind::Jobs),
        MapDriver::new(ProviderKind::Pods),
        Arc::new(ShellSupervisor::new(ShellLimits::default(), shell_closed_tx)),
    ));
    World {
        store,
        billing,
        manager,
    }
}

#[tokio::test]
async fn purchase_session_and_settlement() {
    let world = world().await;
    let user = UserId::new("carol");

    // A pro user starting from zero
    world
        .store
        .create_user(NewUser {
            user_id: user.clone(),
            email: "carol@example.com".to_string(),
            name: "carol".to_string(),
            user_type: UserType::Pro,
            initial_credits: CreditBalance::zero(),
        })
        .await
        .unwrap();
    world
        .store
        .create_workspace(&WorkspaceId::new("ws-main"), &user, "main", "small", None)
        .await
        .unwrap();

    let purchase = world
        .billing
        .purchase_credits(&user, dec!(25.00), "test")
        .await
        .unwrap();
    assert_eq!(purchase.new_balance, dec!(25.00));

    // Medium-tier pod session: 0.025 * 1.5 = 0.0375/h
    let mut req = SessionRequest::new("ws-main", "ns-main", "carol");
    req.provider = "pods".to_string();
    req.resource_tier = ResourceTier::Medium;
    let info = world.manager.create_session(req).await.unwrap();
    assert_eq!(info.provider, ProviderKind::Pods);

    let outcome = world
        .manager
        .execute(&info.id, "python train.py", Duration::from_secs(30), false)
        .await
        .unwrap();
    assert!(outcome.into_result().unwrap().success);

    // Two hours pass
    let backdated = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    sqlx::query("UPDATE session_billing SET start_time = ? WHERE session_id = ?")
        .bind(backdated)
        .bind(&info.id)
        .execute(world.store.pool())
        .await
        .unwrap();

    let completed = world.billing.stop_session_billing(&info.id).await.unwrap();
    assert_eq!(completed.status, BillingStatus::Completed);
    assert_eq!(completed.hourly_rate, dec!(0.0375));
    assert_eq!(completed.total_cost.unwrap(), dec!(0.0750));

    let balance = world.store.get_user_credits(&user).await.unwrap();
    assert_eq!(balance.as_decimal(), dec!(24.9250));

    // Ledger and balance agree
    let history = world.store.get_credit_history(&user, None, None).await.unwrap();
    let sum: rust_decimal::Decimal = history.iter().map(|t| t.amount).sum();
    assert_eq!(sum, balance.as_decimal());

    assert!(world.manager.delete_session(&info.id).await.unwrap());
    assert!(!world.manager.delete_session(&info.id).await.unwrap());
}

#[tokio::test]
async fn session_survives_process_restart() {
    let world = world().await;
    let user = UserId::new("carol");

    world
        .store
        .create_user(NewUser {
            user_id: user.clone(),
            email: "carol@example.com".to_string(),
            name: "carol".to_string(),
            user_type: UserType::Free,
            initial_credits: CreditBalance::from_f64(5.0).unwrap(),
        })
        .await
        .unwrap();
    world
        .store
        .create_workspace(&WorkspaceId::new("ws-main"), &user, "main", "small", None)
        .await
        .unwrap();

    let info = world
        .manager
        .create_session(SessionRequest::new("ws-main", "ns-main", "carol"))
        .await
        .unwrap();

    // A new manager over the same store: fresh cache, same rows
    let (shell_closed_tx, _rx) = mpsc::channel(4);
    let second_manager = SessionManager::new(
        world.store.clone(),
        world.billing.clone(),
        Arc::new(TemplateRegistry::new()),
        MapDriver::new(ProviderKind::Jobs),
        MapDriver::new(ProviderKind::Pods),
        Arc::new(ShellSupervisor::new(ShellLimits::default(), shell_closed_tx)),
    );

    // Restoration reconstructs the persisted session even though the new
    // manager's providers have never seen it
    let restored = second_manager.get_session(&info.id).await.unwrap().unwrap();
    assert_eq!(restored.id, info.id);
    assert_eq!(restored.provider, ProviderKind::Jobs);
}
