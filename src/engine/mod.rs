//! Conditional transfer execution engine
//!
//! - `processor`: lock-guarded evaluation of one order per trigger
//! - `consumer`: pulls trigger deliveries and acks or nacks each one
//! - `sweeper`: republishes triggers for orders still PENDING
//! - `cache`: typed cache helpers and the per-order lock
//! - `memory`: in-process backends for every port

pub mod cache;
pub mod consumer;
pub mod memory;
pub mod processor;
pub mod sweeper;
pub mod traits;

pub use cache::{keys, CacheExt, OrderLock};
pub use consumer::{process_delivery, Disposition, TriggerConsumer};
pub use memory::{MemoryCache, MemoryOrderStore, MemoryTriggerChannel};
pub use processor::{Evaluation, ExecutionProcessor, Outcome};
pub use sweeper::{PendingSweeper, SweepStats};
pub use traits::{
    CoordinationCache, CreateOutcome, Delivery, OrderStore, PendingCursor, SettlementApi,
    TransitionOutcome, TriggerHandler, TriggerPublisher, TriggerSource, UserStore,
};
