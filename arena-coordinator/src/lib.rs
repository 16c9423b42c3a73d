//! Arena Coordinator - durable task queue and battle loops
//!
//! This crate drives the computation in `arena-core` asynchronously:
//! - A task queue with atomic claims, heartbeats and zombie recovery
//! - Workers that seed items and run battle batches
//! - One scheduled battle loop per context, stopped on convergence
//!
//! ## Architecture (4-layer granularity)
//!
//! - Level 1: TaskWorker::run, LoopSupervisor (orchestration)
//! - Level 2: TaskCoordinator, BattleRunner (phases)
//! - Level 3: Task state transitions, store calls with retry (steps)
//! - Level 4: stores, events, configuration
//!
//! Storage, judging and event delivery sit behind traits
//! ([`RatingStore`], [`TaskStore`], [`Judge`], [`EventSink`]).

pub mod battle;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod judge;
pub mod retry;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod worker;

pub use battle::BattleRunner;
pub use config::CoordinatorConfig;
pub use coordinator::{QueueStats, RecoveryReport, TaskCoordinator};
pub use error::{CoordinatorError, JudgeError, Result, StoreError, TaskError};
pub use events::{BroadcastSink, EventSink, MultiSink, ProgressEvent, TracingSink};
pub use judge::{FnJudge, Judge, JudgeRequest, Verdict};
pub use retry::RetryPolicy;
pub use store::{
    Completion, ContextAggregates, EvaluationContext, JsonFileTaskStore, MemoryRatingStore, MemoryTaskStore,
    RatingStore, TaskStore,
};
pub use supervisor::LoopSupervisor;
pub use task::{Task, TaskFilter, TaskId, TaskKind, TaskProgress, TaskStatus, WorkerId};
pub use worker::TaskWorker;
