//! Session manager: provider selection, lifecycle, cache/store reconciliation
//!
//! The in-memory cache is authoritative for hot paths; the store is the
//! durable system-of-record. On first store-reading call the manager runs a
//! one-shot restoration that loads every persisted session, querying its
//! provider once. Provider teardown on delete is fire-and-forget so
//! responses are never blocked on backend I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use caldera_billing::BillingEngine;
use caldera_common::error::{Error, Result};
use caldera_common::types::{ProviderKind, SessionStatus, UserId, WorkspaceId};
use caldera_provider::{
    ExecHandle, ExecOutcome, ExecResult, ProviderDriver, SessionInfo, SessionRequest, ShellStream,
    ShellSupervisor,
};
use caldera_store::{SessionRecord, SessionUpdate, Store};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::templates::TemplateRegistry;

/// Connection surface for a session, handed to the transport layer
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectInfo {
    pub url: Option<String>,
    pub websocket: Option<String>,
}

pub struct SessionManager {
    store: Arc<Store>,
    billing: Arc<BillingEngine>,
    templates: Arc<TemplateRegistry>,
    providers: HashMap<ProviderKind, Arc<dyn ProviderDriver>>,
    shell_supervisor: Arc<ShellSupervisor>,
    cache: Arc<RwLock<HashMap<String, SessionInfo>>>,
    restoration_done: Mutex<bool>,
}

impl SessionManager {
    pub fn new(
        store: Arc<Store>,
        billing: Arc<BillingEngine>,
        templates: Arc<TemplateRegistry>,
        jobs: Arc<dyn ProviderDriver>,
        pods: Arc<dyn ProviderDriver>,
        shell_supervisor: Arc<ShellSupervisor>,
    ) -> Self {
        let mut providers: HashMap<ProviderKind, Arc<dyn ProviderDriver>> = HashMap::new();
        providers.insert(ProviderKind::Jobs, jobs);
        providers.insert(ProviderKind::Pods, pods);

        Self {
            store,
            billing,
            templates,
            providers,
            shell_supervisor,
            cache: Arc::new(RwLock::new(HashMap::new())),
            restoration_done: Mutex::new(false),
        }
    }

    fn driver(&self, kind: ProviderKind) -> Result<&Arc<dyn ProviderDriver>> {
        self.providers.get(&kind).ok_or_else(|| Error::Internal {
            message: format!("no driver registered for provider {kind}"),
        })
    }

    // -------------------- provider choice -------------------- //

    /// Selection rules: interactive and long-lived work goes to pods, short
    /// one-shot work to jobs. An unsupported named provider falls back to
    /// pods, the more capable backend.
    fn choose_provider(&self, req: &SessionRequest) -> ProviderKind {
        if req.provider != "auto" {
            match ProviderKind::normalize(&req.provider) {
                Some(kind) if self.providers.contains_key(&kind) => return kind,
                _ => {
                    warn!(
                        "Requested provider {} not supported, using pods instead",
                        req.provider
                    );
                    return ProviderKind::Pods;
                }
            }
        }

        if req.needs_shell {
            return ProviderKind::Pods;
        }

        if req.long_lived {
            return ProviderKind::Pods;
        }

        if matches!(req.expected_duration_minutes, Some(minutes) if minutes > 60) {
            return ProviderKind::Pods;
        }

        ProviderKind::Jobs
    }

    // -------------------- templates -------------------- //

    /// Overlay template defaults onto the request. The caller wins on env
    /// key conflicts; the template TTL applies only while the caller kept
    /// the default.
    async fn apply_template(&self, req: &mut SessionRequest) -> Result<()> {
        let template_id = req.template_id.clone().unwrap_or_default();
        let template = self.templates.get(&template_id).await?;

        req.resource_tier = template.resource_tier;
        if req.image_spec.image_type.is_empty() {
            req.image_spec.image_type = template.image_type.clone();
        }

        match template.storage_type {
            crate::templates::TemplateStorage::Bucket => {
                req.request_bucket = true;
                req.bucket_size_gb = Some(template.storage_size_gb);
            }
            crate::templates::TemplateStorage::Persistent => {
                req.request_persistent_storage = true;
                req.persistent_storage_size_gb = template.storage_size_gb;
            }
            crate::templates::TemplateStorage::Ephemeral => {}
        }

        for (key, value) in &template.env_vars {
            req.env.entry(key.clone()).or_insert_with(|| value.clone());
        }

        if req.uses_default_ttl() {
            req.ttl_minutes = template.default_ttl_minutes;
        }

        self.templates.increment_usage(&template_id).await?;

        info!(template_id = %template_id, "Applied template to session request");
        Ok(())
    }

    // -------------------- restoration -------------------- //

    /// Load every persisted session into the cache, querying each provider
    /// once. Runs at most once per process lifetime.
    async fn ensure_startup_restoration(&self) {
        let mut done = self.restoration_done.lock().await;
        if *done {
            return;
        }

        info!("Restoring sessions from store on startup");

        match self.store.list_sessions(None).await {
            Ok(records) => {
                let mut restored = 0usize;
                for record in records {
                    let already_cached =
                        self.cache.read().await.contains_key(&record.session_id);
                    if already_cached {
                        continue;
                    }
                    let info = self.resolve_from_record(&record).await;
                    self.cache
                        .write()
                        .await
                        .insert(info.id.clone(), info);
                    restored += 1;
                }
                info!("Startup restoration complete: {restored} sessions restored");
            }
            Err(e) => {
                // Don't keep retrying a broken store on every call
                error!("Startup restoration failed: {e}");
            }
        }

        *done = true;
    }

    /// Turn a store row into a `SessionInfo`: prefer the provider's live
    /// view; otherwise reconstruct a minimal value. Rows with an
    /// unrecognized provider default to pods.
    async fn resolve_from_record(&self, record: &SessionRecord) -> SessionInfo {
        let known_kind = record.provider_kind();
        let kind = known_kind.unwrap_or(ProviderKind::Pods);
        if known_kind.is_none() {
            warn!(
                session_id = %record.session_id,
                "Session has unknown provider {}, defaulting to pods",
                record.provider
            );
        }

        if let Ok(driver) = self.driver(kind) {
            if let Ok(Some(fresh)) = driver.get(&record.session_id).await {
                return fresh;
            }
        }

        let user = record
            .user_id
            .as_ref()
            .map(|u| u.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let mut info = SessionInfo::reconstructed(
            &record.session_id,
            kind,
            record.workspace_id.as_str(),
            &user,
            record.status,
        );
        info.created_at = record.created_at;
        info.storage_config = record.storage_config.clone();
        if known_kind.is_none() {
            info.details
                .insert("provider_defaulted".to_string(), "true".to_string());
        }
        info
    }

    /// Refresh a cached entry from its provider; keeps the cached value
    /// when the backend cannot answer. A provider status other than running
    /// for a session the store thinks is running wins over the store.
    async fn refresh_from_provider(&self, info: SessionInfo) -> SessionInfo {
        let Ok(driver) = self.driver(info.provider) else {
            return info;
        };

        match driver.get(&info.id).await {
            Ok(Some(fresh)) => {
                if fresh.status != SessionStatus::Running {
                    let result = self
                        .store
                        .update_session(
                            &fresh.id,
                            SessionUpdate {
                                status: Some(fresh.status),
                                ..Default::default()
                            },
                        )
                        .await;
                    if let Err(e) = result {
                        debug!(session_id = %fresh.id, "Status writeback failed: {e}");
                    }
                }
                fresh
            }
            Ok(None) | Err(_) => info,
        }
    }

    // -------------------- CRUD -------------------- //

    pub async fn create_session(&self, mut req: SessionRequest) -> Result<SessionInfo> {
        if req.template_id.is_some() {
            self.apply_template(&mut req).await?;
        }

        let kind = self.choose_provider(&req);
        req.provider = kind.as_str().to_string();
        let driver = self.driver(kind)?.clone();

        // Provider failure propagates with nothing persisted
        let info = driver.create(&req).await?;

        if let Err(e) = self
            .store
            .create_session(
                &WorkspaceId::new(&info.workspace_id),
                &info.id,
                kind.as_str(),
                &info.storage_config,
            )
            .await
        {
            error!(session_id = %info.id, "Failed to persist session: {e}");
            // On an id conflict the backend resource belongs to the earlier
            // session; tearing it down would break the winner. Other store
            // failures leave nothing worth keeping.
            if !matches!(e, Error::Conflict { .. }) {
                let _ = driver.delete(&info.id).await;
            }
            return Err(e);
        }

        // Best-effort: record the owner and the live status
        if let Err(e) = self
            .store
            .update_session(
                &info.id,
                SessionUpdate {
                    status: Some(info.status),
                    user_id: Some(UserId::new(&info.user)),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(session_id = %info.id, "Could not record session owner: {e}");
        }

        // Best-effort: attach the workspace's auto-mount storage
        match self
            .store
            .list_workspace_storage(&WorkspaceId::new(&info.workspace_id))
            .await
        {
            Ok(resources) => {
                for resource in resources.into_iter().filter(|r| r.auto_mount) {
                    let mount_path = resource
                        .mount_path
                        .clone()
                        .unwrap_or_else(|| format!("/mnt/{}", resource.resource_name));
                    if let Err(e) = self
                        .store
                        .attach_session_storage(
                            &info.id,
                            &resource.resource_id,
                            &mount_path,
                            resource.access_mode,
                        )
                        .await
                    {
                        warn!(
                            session_id = %info.id,
                            resource_id = %resource.resource_id,
                            "Auto-mount attachment failed: {e}"
                        );
                    }
                }
            }
            Err(e) => debug!(session_id = %info.id, "Storage listing failed: {e}"),
        }

        self.cache
            .write()
            .await
            .insert(info.id.clone(), info.clone());

        if let Err(e) = self
            .billing
            .start_session_billing(&info.id, &UserId::new(&info.user), req.resource_tier)
            .await
        {
            error!(session_id = %info.id, "Billing start failed after provider create: {e}");
            self.cache.write().await.remove(&info.id);
            let _ = self.store.delete_session(&info.id).await;
            let _ = driver.delete(&info.id).await;
            return Err(e);
        }

        info!(session_id = %info.id, provider = %kind, "Session created");

        Ok(info)
    }

    /// Union of the cache and the store, de-duplicated by session id, each
    /// entry refreshed from its provider best-effort.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.ensure_startup_restoration().await;

        let mut sessions = Vec::new();

        let cached: Vec<SessionInfo> = self.cache.read().await.values().cloned().collect();
        for info in cached {
            let fresh = self.refresh_from_provider(info).await;
            self.cache
                .write()
                .await
                .insert(fresh.id.clone(), fresh.clone());
            sessions.push(fresh);
        }

        match self.store.list_sessions(None).await {
            Ok(records) => {
                for record in records {
                    let already_known =
                        self.cache.read().await.contains_key(&record.session_id);
                    if already_known {
                        continue;
                    }
                    let info = self.resolve_from_record(&record).await;
                    self.cache
                        .write()
                        .await
                        .insert(info.id.clone(), info.clone());
                    sessions.push(info);
                }
            }
            Err(e) => warn!("Failed to load sessions from store: {e}"),
        }

        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Cache, then store, then a provider sweep; `None` iff absent from all
    /// three.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>> {
        self.ensure_startup_restoration().await;

        let cached = self.cache.read().await.get(session_id).cloned();
        if let Some(info) = cached {
            let fresh = self.refresh_from_provider(info).await;
            self.cache
                .write()
                .await
                .insert(fresh.id.clone(), fresh.clone());
            return Ok(Some(fresh));
        }

        if let Some(record) = self.store.get_session(session_id).await? {
            let info = self.resolve_from_record(&record).await;
            self.cache
                .write()
                .await
                .insert(info.id.clone(), info.clone());
            return Ok(Some(info));
        }

        for driver in self.providers.values() {
            if let Ok(Some(fresh)) = driver.get(session_id).await {
                self.cache
                    .write()
                    .await
                    .insert(fresh.id.clone(), fresh.clone());
                return Ok(Some(fresh));
            }
        }

        Ok(None)
    }

    /// True when some provider still realizes this session. Used by the
    /// monitor to detect orphans (store row without backend resources).
    /// Backend errors count as live so flaky backends never cause kills.
    pub async fn session_is_live(&self, session_id: &str) -> bool {
        let hint = {
            let cache = self.cache.read().await;
            cache.get(session_id).map(|info| info.provider)
        };

        let mut any_error = false;

        if let Some(kind) = hint {
            if let Ok(driver) = self.driver(kind) {
                match driver.get(session_id).await {
                    Ok(Some(_)) => return true,
                    Ok(None) => {}
                    Err(_) => any_error = true,
                }
            }
        }

        for (kind, driver) in &self.providers {
            if Some(*kind) == hint {
                continue;
            }
            match driver.get(session_id).await {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(_) => any_error = true,
            }
        }

        any_error
    }

    /// Remove a session from every layer. Returns `true` if it existed
    /// anywhere. Provider teardown runs detached; callers must not depend
    /// on the backend being gone when this returns.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        self.ensure_startup_restoration().await;

        let mut resolved = self.cache.read().await.get(session_id).cloned();

        if resolved.is_none() {
            for driver in self.providers.values() {
                match driver.get(session_id).await {
                    Ok(Some(fresh)) => {
                        resolved = Some(fresh);
                        break;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(session_id = %session_id, "Provider probe failed: {e}");
                        continue;
                    }
                }
            }
        }

        if resolved.is_none() {
            if let Some(record) = self.store.get_session(session_id).await? {
                resolved = Some(self.resolve_from_record(&record).await);
            }
        }

        let Some(info) = resolved else {
            warn!(session_id = %session_id, "Session not found in any layer");
            return Ok(false);
        };

        self.cache.write().await.remove(session_id);
        self.shell_supervisor.close(session_id).await;

        if let Err(e) = self.store.delete_session(session_id).await {
            error!(session_id = %session_id, "Failed to remove session row: {e}");
        }

        // Fire-and-forget so HTTP responses are not blocked on teardown
        if let Ok(driver) = self.driver(info.provider) {
            let driver = driver.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = driver.delete(&session_id).await {
                    error!(session_id = %session_id, "Provider teardown failed: {e}");
                }
            });
        }

        info!(session_id = %session_id, "Session deleted");
        Ok(true)
    }

    // -------------------- execution -------------------- //

    async fn resolve_session(&self, session_id: &str) -> Result<SessionInfo> {
        if let Some(info) = self.cache.read().await.get(session_id).cloned() {
            return Ok(info);
        }

        for driver in self.providers.values() {
            if let Ok(Some(fresh)) = driver.get(session_id).await {
                self.cache
                    .write()
                    .await
                    .insert(fresh.id.clone(), fresh.clone());
                return Ok(fresh);
            }
        }

        Err(Error::not_found(format!("session {session_id}")))
    }

    pub async fn execute(
        &self,
        session_id: &str,
        command: &str,
        timeout: Duration,
        async_execution: bool,
    ) -> Result<ExecOutcome> {
        let info = self.resolve_session(session_id).await?;
        self.driver(info.provider)?
            .execute(session_id, command, timeout, async_execution)
            .await
    }

    pub async fn get_job_status(&self, handle: &ExecHandle) -> Result<Option<ExecResult>> {
        let info = self.resolve_session(&handle.session_id).await?;
        self.driver(info.provider)?.get_job_status(handle).await
    }

    /// Open a provider shell wrapped with the idle and hard-cap timers.
    pub async fn open_shell(&self, session_id: &str) -> Result<ShellStream> {
        let info = self.resolve_session(session_id).await?;
        let upstream = self.driver(info.provider)?.open_shell(session_id).await?;
        Ok(self.shell_supervisor.supervise(session_id, upstream).await)
    }

    pub async fn connect_info(&self, session_id: &str) -> Option<ConnectInfo> {
        let cache = self.cache.read().await;
        cache.get(session_id).map(|info| ConnectInfo {
            url: info.url.clone(),
            websocket: info.websocket.clone(),
        })
    }
}
