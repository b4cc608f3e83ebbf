//! Single-step timing measurements against a protected execution domain.
//!
//! A campaign enters the protected domain once per secret. On entry, the
//! domain traps on its execute-disabled entry page, after which a one-shot
//! timer interrupts it after (ideally) every instruction. For each step, the
//! handler records the number of cycles spent in the domain, along with a
//! few optional hardware counters. The resulting log is split into runs and
//! checked offline.
//!
//! The privileged parts (creating the domain, remapping page-table entries,
//! installing the interrupt and fault handlers) live behind the traits in
//! [`platform`]. The [`sim`] module implements them in software.

pub mod error;
pub mod ct;
pub mod pte;
pub mod measure;
pub mod window;
pub mod classify;
pub mod platform;
pub mod counters;
pub mod scenario;
pub mod config;
pub mod secret;
pub mod handler;
pub mod campaign;
pub mod analyze;
pub mod report;
pub mod env;
pub mod sim;

pub use crate::error::{ CampaignError, Result };
pub use crate::config::CampaignConfig;
pub use crate::scenario::{ Scenario, ScenarioKind };
pub use crate::campaign::{ run_campaign, run_campaign_with, RunCampaign };
pub use crate::analyze::{ analyze, verdict, Analysis, Verdict };
pub use crate::platform::{ PageRemapper, ProtectedDomain, StepHooks, Rearm };
pub use crate::counters::{ AuxCounters, NoCounters, PerfCounters, RawEventDesc };
pub use crate::env::FrontalEnv;
