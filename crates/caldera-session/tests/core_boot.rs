//! Boot the full core against in-memory backends and drive one session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use caldera_common::config::CalderaConfig;
use caldera_common::error::Result;
use caldera_common::types::{CreditBalance, ProviderKind, UserId, UserType, WorkspaceId};
use caldera_provider::{
    ExecResult, JobState, JobSubmission, JobsBackend, PodPhase, PodSpec, PodsBackend,
    ServiceEndpoint, ServiceSpec, ShellStream,
};
use caldera_session::Core;
use caldera_store::NewUser;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryJobsBackend {
    services: Mutex<HashMap<String, ServiceEndpoint>>,
    jobs: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl JobsBackend for MemoryJobsBackend {
    async fn deploy_service(&self, spec: &ServiceSpec) -> Result<ServiceEndpoint> {
        let endpoint = ServiceEndpoint {
            service_name: spec.service_name.clone(),
            url: format!("https://{}.run.example", spec.service_name),
        };
        self.services
            .lock()
            .await
            .insert(spec.service_name.clone(), endpoint.clone());
        Ok(endpoint)
    }

    async fn get_service(&self, service_name: &str) -> Result<Option<ServiceEndpoint>> {
        Ok(self.services.lock().await.get(service_name).cloned())
    }

    async fn delete_service(&self, service_name: &str) -> Result<bool> {
        Ok(self.services.lock().await.remove(service_name).is_some())
    }

    async fn submit_job(&self, _service_name: &str, command: &str) -> Result<JobSubmission> {
        let job_id = format!("job-{}", uuid::Uuid::new_v4());
        self.jobs
            .lock()
            .await
            .insert(job_id.clone(), command.to_string());
        Ok(JobSubmission {
            job_name: format!("{job_id}-name"),
            job_id,
        })
    }

    async fn job_state(&self, job_id: &str) -> Result<JobState> {
        let jobs = self.jobs.lock().await;
        Ok(match jobs.get(job_id) {
            Some(command) => JobState::Finished(ExecResult::ok(command.clone())),
            None => JobState::Finished(ExecResult::failed(1, "unknown job")),
        })
    }

    async fn delete_bucket(&self, _bucket_name: &str) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Default)]
struct MemoryPodsBackend {
    pods: Mutex<HashMap<String, PodSpec>>,
}

#[async_trait]
impl PodsBackend for MemoryPodsBackend {
    async fn apply_pod(&self, spec: &PodSpec) -> Result<()> {
        self.pods
            .lock()
            .await
            .insert(format!("{}/{}", spec.namespace, spec.pod_name), spec.clone());
        Ok(())
    }

    async fn pod_phase(&self, namespace: &str, pod_name: &str) -> Result<PodPhase> {
        Ok(
            if self
                .pods
                .lock()
                .await
                .contains_key(&format!("{namespace}/{pod_name}"))
            {
                PodPhase::Running
            } else {
                PodPhase::Missing
            },
        )
    }

    async fn delete_pod(&self, namespace: &str, pod_name: &str) -> Result<bool> {
        Ok(self
            .pods
            .lock()
            .await
            .remove(&format!("{namespace}/{pod_name}"))
            .is_some())
    }

    async fn exec(&self, _namespace: &str, _pod_name: &str, command: &str) -> Result<ExecResult> {
        Ok(ExecResult::ok(command))
    }

    async fn spawn_background(
        &self,
        _namespace: &str,
        _pod_name: &str,
        _command: &str,
    ) -> Result<String> {
        Ok("bg-1".to_string())
    }

    async fn probe_background(
        &self,
        _namespace: &str,
        _pod_name: &str,
        _job_id: &str,
    ) -> Result<Option<ExecResult>> {
        Ok(Some(ExecResult::ok("done")))
    }

    async fn open_exec_stream(&self, _namespace: &str, _pod_name: &str) -> Result<ShellStream> {
        let (client_end, _session_end) = ShellStream::pair(4);
        Ok(client_end)
    }
}

#[tokio::test]
async fn boot_create_execute_shutdown() {
    let mut config = CalderaConfig::default();
    config.database.path = ":memory:".to_string();

    let mut core = Core::boot(
        config,
        Arc::new(MemoryJobsBackend::default()),
        Arc::new(MemoryPodsBackend::default()),
    )
    .await
    .unwrap();

    let notifications = core.take_notifications();
    assert!(notifications.is_some());
    assert!(core.take_notifications().is_none());

    core.store
        .create_user(NewUser {
            user_id: UserId::new("dave"),
            email: "dave@example.com".to_string(),
            name: "dave".to_string(),
            user_type: UserType::Free,
            initial_credits: CreditBalance::from_f64(5.0).unwrap(),
        })
        .await
        .unwrap();
    core.store
        .create_workspace(
            &WorkspaceId::new("ws-core"),
            &UserId::new("dave"),
            "core",
            "small",
            None,
        )
        .await
        .unwrap();

    let info = core
        .manager
        .create_session(caldera_provider::SessionRequest::new(
            "ws-core", "ns-core", "dave",
        ))
        .await
        .unwrap();
    assert_eq!(info.provider, ProviderKind::Jobs);

    let outcome = core
        .manager
        .execute(&info.id, "echo core", Duration::from_secs(5), false)
        .await
        .unwrap();
    assert_eq!(outcome.into_result().unwrap().stdout, "echo core");

    assert!(core.manager.delete_session(&info.id).await.unwrap());

    core.shutdown().await;
}
