//! Deployer
//!
//! Turns a git repository into a running, resource-capped bot container:
//! fetch, detect the runtime, build an image, create and start the container.
//! Also owns the container lifecycle afterwards (start, stop, logs, delete)
//! and the status state machine every deployment moves through.

pub mod builder;
pub mod config;
pub mod detector;
pub mod docker;
pub mod engine;
pub mod fetcher;
pub mod logs;
pub mod mock;
pub mod orchestrator;
pub mod sink;
pub mod supervisor;

pub use builder::{ImageBuilder, ImageHandle};
pub use config::DeployerConfig;
pub use detector::{RuntimeKind, RuntimeProfile};
pub use docker::DockerEngine;
pub use engine::{ContainerDetails, ContainerEngine, EngineError, RestartPolicy, DEPLOYMENT_LABEL};
pub use fetcher::{GitFetcher, SourceFetcher};
pub use logs::{LogReader, CONTAINER_NOT_FOUND_PLACEHOLDER};
pub use mock::MockEngine;
pub use orchestrator::{Orchestrator, CONTAINER_LOST, RESTART_INTERRUPTED};
pub use sink::{MemorySink, StatusSink};
pub use supervisor::{StartOutcome, StopOutcome, Supervisor};
