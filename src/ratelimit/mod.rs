//! Rate limiting logic and state management.

mod block;
mod counter;
mod engine;
mod penalty;
mod rules;
mod scope;
mod store;
mod sweeper;
mod verdict;

pub use block::{BlockRecord, BlockRegistry};
pub use counter::{Admission, CounterEntry, StoreError};
pub use engine::{PolicyEngine, Stats, Whitelist};
pub use penalty::{Escalation, PenaltyConfig};
pub use rules::{EndpointOverride, LimitsConfig, StrategyConfig, StrategyTable};
pub use scope::{ScopeKey, ScopeType};
pub use store::{AppliedPenalty, CounterDecision, CounterStore, ViolatorStat};
pub use sweeper::{SweepReport, Sweeper};
pub use verdict::{retry_after_secs, Verdict, ViolationType};
