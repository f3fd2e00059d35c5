//! Email decision pipeline.
//!
//! Every observed email flows through:
//! 1. `Analyzer::analyze()`: model judgment, normalized by `normalize`
//! 2. `BehaviorSignal::profile()`: historical user behavior
//! 3. `ActionRouter::route()`: blends both into one final action
//! 4. `ActionExecutor::execute()`: idempotent side effects
//!
//! `EmailProcessor` drives the steps and owns retry bookkeeping.

pub mod analyzer;
pub mod executor;
pub mod normalize;
pub mod processor;
pub mod router;
pub mod types;
