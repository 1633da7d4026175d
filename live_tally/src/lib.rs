/*!

Live vote tallies reconciled from a snapshot and a push subscription.

The core of this crate is the [`TallyEngine`]: it loads the full history of
votes once, listens to newly inserted votes, and merges both into a single
per-candidate count in which every vote is counted exactly once, whatever the
order and the number of times it is delivered. Leaderboards are derived from
those counts on demand.

See the [`manual`] for the reconciliation rules and the collaborator
interfaces.
*/

pub mod builder;
mod config;
pub mod engine;
pub mod gateway;
pub mod manual;
pub mod memory;
pub mod merger;
pub mod ranking;
pub mod snapshot;
pub mod store;
pub mod subscriber;

pub use crate::config::*;
pub use crate::engine::TallyEngine;
