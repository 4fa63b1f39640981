//! Command execution policy and approval coordination.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                                                              │
//! │  Submission ──► ApprovalCoordinator ──► evaluate_document    │
//! │                       │                      │               │
//! │                       │            deny / allow / default    │
//! │                       │                      │               │
//! │                       │      matched ◄───────┴──► no match   │
//! │                       │         │                   │        │
//! │                       │   resolve (policy)   park + timer    │
//! │                       │                             │        │
//! │                       │     operator / remote / timeout      │
//! │                       ▼                             │        │
//! │                 history (append-only) ◄─────────────┘        │
//! │                                                              │
//! │  PolicyStore ◄── always-allow, replace, patch                │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use helix_security::{ApprovalCoordinator, ApprovalSubmission, PolicyStore, Scope};
//!
//! let store = Arc::new(PolicyStore::open("exec-approvals.json")?);
//! let coordinator = ApprovalCoordinator::new(store).shared();
//!
//! let outcome = coordinator
//!     .submit(ApprovalSubmission::new("git push origin main", Scope::agent("main")))
//!     .await?;
//! ```

mod approval;
mod engine;
mod error;
mod models;
mod pattern;
mod store;

pub use approval::{
    ApprovalCallback, ApprovalCoordinator, Resolution, ResolutionOrigin, ResolveOutcome,
    SubmitOutcome, derive_allow_pattern,
};
pub use engine::{PolicyEngine, evaluate_document};
pub use error::{ApprovalError, PolicyError, Result};
pub use models::{
    AgentPolicy, ApprovalDecision, ApprovalRequest, ApprovalState, ApprovalSubmission,
    DefaultPolicy, HistoryEntry, InvalidPattern, ListKind, MatchedRule, NodePolicy,
    PolicyDocument, PolicyLocation, PolicyPatch, RESOLVER_OPERATOR, RESOLVER_POLICY,
    RESOLVER_TIMEOUT, Scope, TimeoutAction, Verdict, VerdictKind,
};
pub use pattern::{CommandMatcher, compile_patterns};
pub use store::PolicyStore;
