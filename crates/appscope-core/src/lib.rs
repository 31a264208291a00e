//! Task orchestration core: persisted task state, deduplicated submission,
//! and the staged collection pipeline that runs behind it.

pub mod config;
pub mod error;
pub mod export;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod publish;
pub mod service;
pub mod stage_log;
pub mod store;
pub mod supervisor;

pub use config::{CoreConfig, TtlPolicy};
pub use error::{StoreError, TaskError};
pub use lifecycle::TaskManager;
pub use model::{StatusReport, Submission, SubmitRequest, TaskPatch, TaskRecord, TaskStatus};
