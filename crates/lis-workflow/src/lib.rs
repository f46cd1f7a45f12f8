//! # LIS Workflow
//!
//! 结果流水线核心: 解码后的观测与待检医嘱的匹配、医嘱状态机、
//! 危急值警报、差值核查、质控(Westgard/Levey-Jennings)以及
//! 协调全部组件的LabService。

pub mod critical_value;
pub mod delta_check;
pub mod engine;
pub mod matcher;
pub mod notify;
pub mod qc;
pub mod state_machine;
pub mod worklist;

pub use critical_value::CriticalValueEngine;
pub use delta_check::{DeltaCheckEngine, DeltaCheckOutcome, DeltaCheckReport};
pub use engine::{LabConfig, LabService, LabStores};
pub use matcher::{MatchOutcome, ProcessOutcome, ProcessedResult, ResultMatcher};
pub use notify::{LoggingNotifier, ResultNotifier, WebhookNotifier};
pub use qc::{LeveyJenningsChart, QcEngine};
pub use state_machine::{OrderAction, OrderStateMachine};
pub use worklist::{SendWorklistOutcome, WorklistDispatcher};
