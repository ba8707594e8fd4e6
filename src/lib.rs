//! Bulwark - Adaptive Rate Limiting and Anti-Abuse Admission Control
//!
//! This crate decides, for every incoming request, whether it is admitted.
//! Requests are checked against existing blocks, heuristic anti-spam rules
//! and fixed-window strategies scoped globally, per IP, per user and per
//! endpoint. Repeat offenders are blocked for progressively longer, and a
//! background sweeper keeps memory bounded.

pub mod antispam;
pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod service;

pub use config::{BulwarkConfig, FailMode};
pub use context::{AdmissionRequest, Identity, RequestContext};
pub use error::{BulwarkError, Result};
pub use ratelimit::{ScopeKey, ScopeType, Verdict, ViolationType};
pub use service::Bulwark;
