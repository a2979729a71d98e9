//! Flow orchestration: the run state machine and the runner that drives it.

pub mod manifest;
pub mod observer;
pub mod request;
mod runner;
pub mod state;

pub use manifest::{AdapterNames, RunManifest};
pub use observer::{NoopObserver, TracingObserver, TransitionObserver};
pub use request::{AnalyzeRequest, SourceInput, ValidatedRequest};
pub use runner::{Adapters, FlowRunner, RunHandle, RunResult, StartMode};
pub use state::{FlowEvent, FlowNode, FlowState};
