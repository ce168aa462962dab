//! Storage orchestration: provision priced storage resources, manage
//! workspace defaults, and attach auto-mount storage to sessions.
//!
//! Charging happens before the row exists so quota counts stay honest; a
//! failed row insert refunds the charge best-effort.

use std::sync::Arc;

use caldera_billing::BillingEngine;
use caldera_common::error::Result;
use caldera_common::types::{AccessMode, CreditBalance, StorageType, UserId, WorkspaceId};
use caldera_store::{SessionAttachmentRecord, StorageResourceRecord, Store};
use tracing::{info, warn};
use uuid::Uuid;

/// Default mount point for attached storage
const DEFAULT_MOUNT_ROOT: &str = "/mnt";

pub struct StorageService {
    store: Arc<Store>,
    billing: Arc<BillingEngine>,
}

impl StorageService {
    pub fn new(store: Arc<Store>, billing: Arc<BillingEngine>) -> Self {
        Self { store, billing }
    }

    /// Provision a storage resource: enforce quota, charge for the initial
    /// period, persist the row, and optionally bind it to a workspace.
    pub async fn create_storage(
        &self,
        user_id: &UserId,
        workspace_id: Option<&WorkspaceId>,
        storage_type: StorageType,
        resource_name: &str,
        size_gb: i64,
        duration_days: i64,
    ) -> Result<StorageResourceRecord> {
        let resource_id = format!("{}-{}", storage_type, Uuid::new_v4());

        let charge = self
            .billing
            .process_storage_creation_billing(
                user_id,
                storage_type,
                size_gb,
                duration_days,
                &resource_id,
            )
            .await?;

        let record = match self
            .store
            .create_storage_resource(&resource_id, user_id, storage_type, resource_name, size_gb)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                // The charge landed but the row didn't; give the money back
                warn!(resource_id = %resource_id, "Storage row creation failed, refunding: {e}");
                let refund = self
                    .store
                    .add_credits(
                        user_id,
                        CreditBalance::from_decimal(charge.cost),
                        "storage_refund",
                        Some(&format!("Refund for failed {storage_type} creation")),
                    )
                    .await;
                if let Err(refund_err) = refund {
                    warn!(resource_id = %resource_id, "Refund failed: {refund_err}");
                }
                return Err(e);
            }
        };

        let record = match workspace_id {
            Some(workspace_id) => {
                self.store
                    .assign_storage_to_workspace(&resource_id, workspace_id)
                    .await?
            }
            None => record,
        };

        info!(
            resource_id = %resource_id,
            user_id = %user_id,
            storage_type = %storage_type,
            size_gb,
            cost = %charge.cost,
            "Storage resource created"
        );

        Ok(record)
    }

    /// Make a resource the workspace default for its type and mark it for
    /// automatic mounting into new sessions.
    pub async fn set_default_with_auto_mount(
        &self,
        workspace_id: &WorkspaceId,
        storage_type: StorageType,
        resource_id: &str,
        mount_path: Option<&str>,
    ) -> Result<StorageResourceRecord> {
        self.store
            .set_workspace_default_storage(workspace_id, storage_type, resource_id)
            .await?;

        let record = self.store.get_storage_resource(resource_id).await?;
        let mount_path = mount_path
            .map(str::to_string)
            .unwrap_or_else(|| format!("{DEFAULT_MOUNT_ROOT}/{}", record.resource_name));

        self.store
            .update_storage_mount(resource_id, true, Some(&mount_path), AccessMode::ReadWrite)
            .await
    }

    /// Attach every auto-mount resource of a workspace to a session.
    /// Best-effort: a failed attachment is logged and skipped.
    pub async fn attach_auto_mount_storage(
        &self,
        session_id: &str,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<SessionAttachmentRecord>> {
        let resources = self.store.list_workspace_storage(workspace_id).await?;
        let mut attached = Vec::new();

        for resource in resources.into_iter().filter(|r| r.auto_mount) {
            let mount_path = resource
                .mount_path
                .clone()
                .unwrap_or_else(|| format!("{DEFAULT_MOUNT_ROOT}/{}", resource.resource_name));

            match self
                .store
                .attach_session_storage(
                    session_id,
                    &resource.resource_id,
                    &mount_path,
                    resource.access_mode,
                )
                .await
            {
                Ok(attachment) => attached.push(attachment),
                Err(e) => warn!(
                    session_id = %session_id,
                    resource_id = %resource.resource_id,
                    "Auto-mount attachment failed: {e}"
                ),
            }
        }

        Ok(attached)
    }

    /// Detach all live attachments of a session (used on teardown).
    pub async fn detach_all(&self, session_id: &str) -> Result<usize> {
        let attachments = self.store.list_session_attachments(session_id).await?;
        let mut detached = 0;

        for attachment in attachments
            .iter()
            .filter(|a| a.detached_at.is_none())
        {
            if self
                .store
                .detach_session_storage(session_id, &attachment.storage_id)
                .await?
            {
                detached += 1;
            }
        }

        Ok(detached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caldera_common::config::CalderaConfig;
    use caldera_common::error::Error;
    use caldera_common::types::UserType;
    use caldera_store::NewUser;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn service_with_workspace(credits: f64, user_type: UserType) -> (Arc<Store>, StorageService) {
        let store = Arc::new(Store::for_testing().await.unwrap());
        store
            .create_user(NewUser {
                user_id: UserId::new("alice"),
                email: "alice@example.com".to_string(),
                name: "alice".to_string(),
                user_type,
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
        (store.clone(), StorageService::new(store, billing))
    }

    #[tokio::test]
    async fn test_create_charges_and_persists() {
        let (store, service) = service_with_workspace(10.0, UserType::Pro).await;
        let user = UserId::new("alice");

        let record = service
            .create_storage(
                &user,
                Some(&WorkspaceId::new("ws-1")),
                StorageType::Bucket,
                "datasets",
                10,
                30,
            )
            .await
            .unwrap();
        assert_eq!(record.workspace_id, Some(WorkspaceId::new("ws-1")));

        // 10 GB * 0.02/month * 1 month
        let balance = store.get_user_credits(&user).await.unwrap();
        assert_eq!(balance.as_decimal(), dec!(9.8));

        let history = store.get_credit_history(&user, None, None).await.unwrap();
        assert_eq!(
            history[0].storage_resource_id.as_deref(),
            Some(record.resource_id.as_str())
        );
    }

    #[tokio::test]
    async fn test_create_rejects_when_priced_out() {
        let (store, service) = service_with_workspace(0.1, UserType::Pro).await;
        let user = UserId::new("alice");

        let err = service
            .create_storage(&user, None, StorageType::Filestore, "big", 100, 30)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientCredits { .. }));

        // Nothing charged, nothing created
        let balance = store.get_user_credits(&user).await.unwrap();
        assert_eq!(balance.as_decimal(), dec!(0.1));
        assert!(store
            .list_workspace_storage(&WorkspaceId::new("ws-1"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_quota_enforced_before_charge() {
        let (store, service) = service_with_workspace(50.0, UserType::Free).await;
        let user = UserId::new("alice");

        service
            .create_storage(&user, None, StorageType::Bucket, "one", 10, 30)
            .await
            .unwrap();
        let balance_after_first = store.get_user_credits(&user).await.unwrap();

        // Free tier allows one bucket
        let err = service
            .create_storage(&user, None, StorageType::Bucket, "two", 10, 30)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));

        // The rejected attempt cost nothing
        let balance = store.get_user_credits(&user).await.unwrap();
        assert_eq!(balance, balance_after_first);
    }

    #[tokio::test]
    async fn test_auto_mount_attachment_flow() {
        let (store, service) = service_with_workspace(10.0, UserType::Pro).await;
        let user = UserId::new("alice");
        let ws = WorkspaceId::new("ws-1");

        let record = service
            .create_storage(&user, Some(&ws), StorageType::Bucket, "datasets", 10, 30)
            .await
            .unwrap();
        let record = service
            .set_default_with_auto_mount(&ws, StorageType::Bucket, &record.resource_id, None)
            .await
            .unwrap();
        assert!(record.auto_mount);
        assert_eq!(record.mount_path.as_deref(), Some("/mnt/datasets"));

        store
            .create_session(&ws, "s-1", "pods", &json!({}))
            .await
            .unwrap();

        let attached = service
            .attach_auto_mount_storage("s-1", &ws)
            .await
            .unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].mount_path, "/mnt/datasets");

        assert_eq!(service.detach_all("s-1").await.unwrap(), 1);
        // Everything already detached
        assert_eq!(service.detach_all("s-1").await.unwrap(), 0);
    }
}
