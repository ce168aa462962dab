//! Process-wide context: every singleton the core needs, constructed at
//! boot and threaded to handlers explicitly. No module-level globals — this
//! keeps shutdown clean and multi-instance tests possible.

use std::sync::Arc;

use caldera_billing::{BillingEngine, UserService};
use caldera_common::error::Result;
use caldera_common::CalderaConfig;
use caldera_provider::{
    JobsBackend, JobsProvider, JobsProviderConfig, PodsBackend, PodsProvider, PodsProviderConfig,
    ShellLimits, ShellSupervisor,
};
use caldera_store::Store;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::manager::SessionManager;
use crate::monitor::{KillNotification, SessionMonitor};
use crate::storage::StorageService;
use crate::templates::TemplateRegistry;

pub struct Core {
    pub config: CalderaConfig,
    pub store: Arc<Store>,
    pub billing: Arc<BillingEngine>,
    pub users: Arc<UserService>,
    pub storage: Arc<StorageService>,
    pub templates: Arc<TemplateRegistry>,
    pub manager: Arc<SessionManager>,
    pub monitor: Arc<SessionMonitor>,
    notifications: Option<mpsc::Receiver<KillNotification>>,
    shell_reaper: JoinHandle<()>,
}

impl Core {
    /// Wire up the whole core against the given backend adapters and start
    /// the background tasks.
    pub async fn boot(
        config: CalderaConfig,
        jobs_backend: Arc<dyn JobsBackend>,
        pods_backend: Arc<dyn PodsBackend>,
    ) -> Result<Core> {
        config.validate()?;
        for warning in config.warnings() {
            warn!("{warning}");
        }

        let store = Arc::new(Store::new(&config.database.path).await?);
        let billing = Arc::new(BillingEngine::new(store.clone(), config.billing.clone()));
        let users = Arc::new(UserService::new(store.clone(), config.billing.clone()));
        let storage = Arc::new(StorageService::new(store.clone(), billing.clone()));
        let templates = Arc::new(TemplateRegistry::new());

        let jobs = Arc::new(JobsProvider::with_config(
            jobs_backend,
            JobsProviderConfig {
                poll_interval: config.jobs_poll_interval(),
                default_image: config.provider.default_image.clone(),
                job_idle_ttl: std::time::Duration::from_secs(
                    config.provider.job_idle_ttl_minutes * 60,
                ),
                ..Default::default()
            },
        ));
        let pods = Arc::new(PodsProvider::with_config(
            pods_backend,
            PodsProviderConfig {
                readiness_timeout: config.pods_readiness_timeout(),
                readiness_poll_interval: config.pods_readiness_poll_interval(),
                default_image: config.provider.default_image.clone(),
            },
        ));

        let (shell_closed_tx, mut shell_closed_rx) = mpsc::channel::<String>(64);
        let shell_supervisor = Arc::new(ShellSupervisor::new(
            ShellLimits {
                idle_timeout: config.shell_idle_timeout(),
                max_duration: config.shell_max_duration(),
            },
            shell_closed_tx,
        ));

        let manager = Arc::new(SessionManager::new(
            store.clone(),
            billing.clone(),
            templates.clone(),
            jobs,
            pods,
            shell_supervisor,
        ));

        // A shell expiring is a normal session end: settle billing, delete
        let reaper_manager = manager.clone();
        let reaper_billing = billing.clone();
        let shell_reaper = tokio::spawn(async move {
            while let Some(session_id) = shell_closed_rx.recv().await {
                info!(session_id = %session_id, "Shell closed, ending session");
                if let Err(e) = reaper_billing.stop_session_billing(&session_id).await {
                    error!(session_id = %session_id, "Error stopping billing for closed shell: {e}");
                }
                if let Err(e) = reaper_manager.delete_session(&session_id).await {
                    error!(session_id = %session_id, "Error deleting session for closed shell: {e}");
                }
            }
        });

        let (notify_tx, notify_rx) = mpsc::channel(64);
        let monitor = Arc::new(SessionMonitor::new(
            store.clone(),
            billing.clone(),
            manager.clone(),
            config.monitor.clone(),
            notify_tx,
        ));
        monitor.start().await;

        info!(service = %config.service.name, "Core booted");

        Ok(Core {
            config,
            store,
            billing,
            users,
            storage,
            templates,
            manager,
            monitor,
            notifications: Some(notify_rx),
            shell_reaper,
        })
    }

    /// Kill-notification stream; the transport layer takes it once.
    pub fn take_notifications(&mut self) -> Option<mpsc::Receiver<KillNotification>> {
        self.notifications.take()
    }

    pub async fn shutdown(self) {
        self.monitor.stop().await;
        self.shell_reaper.abort();
        self.store.pool().close().await;
        info!("Core shut down");
    }
}
