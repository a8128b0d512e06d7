//! # podium-core
//!
//! The real-time leaderboard pipeline for Podium.
//!
//! This crate provides:
//!
//! - **Ranked sets** - ordered member→score sets with `O(log N)` rank queries
//! - **Event log** - append-only streams with consumer groups and pending lists
//! - **Consumers** - cancellable consumer-group loops with reclaim and dead-lettering
//! - **Hub** - live-client registry with topic, user, and global fan-out
//! - **Services** - the leaderboard and history use cases tying them together
//!
//! ## Architecture
//!
//! ```text
//!  score ─▶ LeaderboardService ─▶ RankedSetStore
//!                  │
//!                  ├──────────▶ EventLog ──▶ consumer ──▶ HistoryRecorder
//!                  │               ▲
//!                  │             Outbox (failed appends)
//!                  ▼
//!                 Hub ──▶ client queues ──▶ live connections
//! ```

pub mod consumer;
pub mod event_log;
pub mod history;
pub mod hub;
pub mod model;
pub mod outbox;
pub mod ranked;
pub mod repository;
pub mod service;
pub mod skiplist;
pub mod topic;

pub use consumer::{subscribe, BoxError, ConsumerConfig, ConsumerError, StreamHandler, Subscription};
pub use event_log::{EntryId, EventLog, EventLogExt, LogError, MemoryEventLog, StreamEntry};
pub use history::{HistoryRecorder, HistoryService};
pub use hub::{Broadcaster, Client, ClientId, Hub, HubConfig, HubError, HubLoop, HubStats};
pub use model::{
    HistoryFilter, HistoryRecord, Leaderboard, LeaderboardDetail, LeaderboardPatch,
    NewLeaderboard, Page, PageRequest,
};
pub use outbox::{Flusher, Outbox};
pub use ranked::{
    LeaderboardEntry, MemberRank, MemoryRankedStore, RankWindow, RankedSetStore, StoreError,
};
pub use repository::{
    HistoryRepository, LeaderboardRepository, MemoryHistoryRepository,
    MemoryLeaderboardRepository, RepositoryError,
};
pub use service::{LeaderboardService, RankedEntry, ScoreUpdate, ServiceConfig, ServiceError};
