//! rosto-engine — Registration workflow from detected regions to stored identities.

pub mod workflow;

pub use workflow::{BatchReport, ErrorKind, PendingIdentity, RegionOutcome, Workflow, WorkflowError};
