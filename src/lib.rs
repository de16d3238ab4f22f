pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod engine;
pub mod error;
pub mod services;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal};
pub use engine::{Evaluation, ExecutionProcessor, Outcome, PendingSweeper, TriggerConsumer};
pub use error::{RatewatchError, Result, SettlementError};
pub use services::TransferService;
