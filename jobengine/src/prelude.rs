//! The purpose of this module is to alleviate the need to import many of the `[jobengine]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobengine::prelude::*;
//! ```
pub use crate::config::EngineConfig;
pub use crate::job::{Job, JobId, JobStatus, Metadata};
pub use crate::job_log::JobLog;
pub use crate::notifier::NotifierConfig;
pub use crate::pruner::PrunerConfig;
pub use crate::task::{ExecutionResult, JobContext, Task, TaskError};
pub use crate::{JobEngine, JobEngineError};
