//! Story memory: the running record of what the manuscript has established.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        StoryMemory                           │
//! │                                                              │
//! │  ┌────────────┐  ┌──────────────────┐  ┌─────────────────┐   │
//! │  │ Timeline   │  │ CharacterStates  │  │ EstablishedFacts│   │
//! │  │ (append)   │  │ (name→state)     │  │ (deduplicated)  │   │
//! │  └────────────┘  └──────────────────┘  └─────────────────┘   │
//! │                                                              │
//! │  ┌────────────┐  ┌──────────────────┐  ┌─────────────────┐   │
//! │  │ PlotThreads│  │ Locations        │  │ Items           │   │
//! │  └────────────┘  └──────────────────┘  └─────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The store never talks to the oracle. Deltas extracted by the
//! [`crate::updater::MemoryUpdater`] are applied through its mutators.

mod records;
mod seed;
mod store;

pub use records::{
    CharacterState, CharacterUpdate, ItemRecord, LocationRecord, LocationUpdate, PlotThread,
    ThreadStatus, ThreadUpdate, TimelineEntry,
};
pub use store::{MemoryStats, StoryMemory};
