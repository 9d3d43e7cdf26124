//! Runtime for the image studio: media service clients, session state,
//! local transforms and the action orchestrator.

pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod poller;
pub mod session;
pub mod transforms;

pub use client::{DryrunClient, GeminiClient, OperationClient};
pub use config::EngineConfig;
pub use error::{ActionError, ActionResult};
pub use orchestrator::{
    Action, ActionOrchestrator, ActionOutcome, OrchestratorOptions, SelectionKind,
};
pub use poller::{ImmediateScheduler, PollerState, Scheduler, ThreadScheduler};
pub use session::SessionState;
