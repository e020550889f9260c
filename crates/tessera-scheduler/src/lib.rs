//! tessera-scheduler — operations, job dispatch and preemption.
//!
//! # Architecture
//!
//! ```text
//!   API ──▶ start / abort / suspend ──┐
//!                                     ▼
//!   node heartbeat ──▶ SchedulerService ──▶ Scheduler ◀── fair-share loop
//!        │            (limiter, delay,       │   │          (engines, hangup,
//!        │             ban cancellation)     │   │           suspicious jobs)
//!        ▼                                   │   ▼
//!   HeartbeatResponse ◀── dispatch / preempt ┘  PoolTrees + NodeRegistry
//!                                                │
//!                                                └──▶ SchedulerEvent log
//! ```
//!
//! Operations are placed into one pool per tree they run in. An operation
//! waits in `pending` while an ancestor pool is at its running operation
//! limit. Running operations get jobs on node heartbeats, lowest
//! satisfaction first; starving operations may preempt jobs of operations
//! above their fair share.

pub mod dispatch;
pub mod error;
pub mod events;
pub mod hangup;
pub mod heartbeat;
pub mod job;
pub mod operation;
pub mod preemption;
pub mod scheduler;
pub mod service;

pub use error::{SchedulerError, SchedulerResult};
pub use events::{SchedulerEvent, SchedulerEventKind};
pub use hangup::{LIMITING_ANCESTOR_MESSAGE, NO_SCHEDULED_JOBS_MESSAGE};
pub use heartbeat::{HeartbeatLimiter, HeartbeatPermit, HeartbeatRequest, HeartbeatResponse, JobStart, NodeTokens};
pub use job::{AbortReason, Job, JobState, PreemptedFor};
pub use operation::{Operation, OperationSpec, OperationState, PreemptionMode, TreeParams};
pub use preemption::{classify_jobs, select_victims, Candidate, JobPreemptionStatus, PreemptionThresholds, RunningJob};
pub use scheduler::Scheduler;
pub use service::SchedulerService;
