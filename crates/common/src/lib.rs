pub mod error;
pub mod models;

pub use error::{DeployError, Result};
pub use models::{
    Deployment, DeploymentId, DeploymentStatus, ResourceProfile, StatusSnapshot,
};
