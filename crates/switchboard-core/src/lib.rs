//! # switchboard-core
//!
//! Connection hub and in-process event bus for the Switchboard realtime
//! service.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Live session registry, rooms, and targeted delivery
//! - **Session** - The hub-owned half of a connection
//! - **Bus** - Topic-keyed publish/subscribe with bounded queues
//! - **WorkerPool** - N workers sharing one topic subscription
//! - **Fanout** / **Pipeline** - Event stream composition
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  commands  ┌─────────────┐   frames   ┌─────────────┐
//! │  Sessions   │───────────▶│     Hub     │───────────▶│  Sessions   │
//! └─────────────┘            └─────────────┘            └─────────────┘
//!
//! ┌─────────────┐  publish   ┌─────────────┐   events   ┌─────────────┐
//! │  Producers  │───────────▶│     Bus     │───────────▶│ Subscribers │
//! └─────────────┘            └─────────────┘            └─────────────┘
//!                                                        WorkerPool
//!                                                        Fanout
//!                                                        Pipeline
//! ```

pub mod bus;
pub mod event;
pub mod fanout;
pub mod hub;
pub mod pipeline;
pub mod room;
pub mod session;
pub mod worker;

pub use bus::{Bus, BusConfig, BusStats, Subscriber, SubscriberId, Subscription, Topic};
pub use event::{Event, EventId};
pub use fanout::Fanout;
pub use hub::{Hub, HubConfig, HubError, HubStats, Target};
pub use pipeline::{Pipeline, PipelineHandle, StageError};
pub use room::{validate_room_name, RoomId, Rooms};
pub use session::{Delivery, Session, SessionId};
pub use worker::{EventHandler, HandlerFailure, WorkerPool};

pub use tokio_util::sync::CancellationToken;
