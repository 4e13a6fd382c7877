//! Kanade Memory - Per-user conversation memory for the Kanade bot.
//!
//! One [`MemoryStore`] owns a record per user holding both the conversation
//! (two priming turns plus a bounded window of recent exchanges) and the
//! activity counters used for idle eviction and the leaderboard. Keeping both
//! in one record means a user is always added and removed as a unit.
//!
//! ## Concurrency
//!
//! Each user record sits behind its own async mutex. A caller that holds a
//! [`UserEntry`] has exclusive access to that user until the entry is dropped,
//! which is how a whole exchange (activity, model call, append) is serialized
//! per user while other users proceed. The [`EvictionSweeper`] takes the same
//! lock before removing anyone.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod error;
pub mod store;
pub mod sweeper;
pub mod turn;

pub use error::{MemoryError, MemoryResult};
pub use store::{Conversation, MemoryStore, StoreStats, UserEntry};
pub use sweeper::{EvictionSweeper, SweepReport, SweeperConfig};
pub use turn::{Part, Role, Turn};
