//! Bounded pool of precomputed fountain encoding plans.
//!
//! Generating a RaptorQ encoding plan is the expensive one-time step of
//! fountain encoding, so plans are recycled through a small process-wide
//! pool keyed by symbol count. Acquire on encoder creation, release on drop.
//! A miss generates a fresh plan; releasing into a full pool frees the plan.

use std::sync::Mutex;

use raptorq::SourceBlockEncodingPlan;

/// Number of plan slots kept alive across encoder lifetimes.
pub const CACHE_STATES_COUNT: usize = 5;

static PLAN_POOL: Mutex<Vec<(u16, SourceBlockEncodingPlan)>> = Mutex::new(Vec::new());

/// Fetches a plan for `symbol_count` symbols, generating one on a pool miss.
pub(crate) fn acquire_plan(symbol_count: u16) -> SourceBlockEncodingPlan {
    {
        let mut pool = PLAN_POOL.lock().expect("plan pool poisoned");
        if let Some(pos) = pool.iter().position(|(count, _)| *count == symbol_count) {
            return pool.swap_remove(pos).1;
        }
    }
    SourceBlockEncodingPlan::generate(symbol_count)
}

/// Returns a plan to the pool; dropped silently when the pool is full.
pub(crate) fn release_plan(symbol_count: u16, plan: SourceBlockEncodingPlan) {
    let mut pool = PLAN_POOL.lock().expect("plan pool poisoned");
    if pool.len() < CACHE_STATES_COUNT {
        pool.push((symbol_count, plan));
    }
}
