pub mod backend;
pub mod driver;
pub mod jobs;
pub mod pods;
pub mod shell;
pub mod types;

pub use backend::{
    JobsBackend, JobState, JobSubmission, PodPhase, PodSpec, PodsBackend, ServiceEndpoint,
    ServiceSpec,
};
pub use driver::ProviderDriver;
pub use jobs::{JobsProvider, JobsProviderConfig};
pub use pods::{PodsProvider, PodsProviderConfig};
pub use shell::{ShellFrame, ShellLimits, ShellStream, ShellSupervisor};
pub use types::{ExecHandle, ExecOutcome, ExecResult, ImageSpec, ResourceSpec, SessionInfo, SessionRequest};
