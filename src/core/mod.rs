//! 核心编排层：错误、适配器状态、观察抽象、trace、主控编排与关闭信号

pub mod error;
pub mod observation;
pub mod orchestrator;
pub mod shutdown;
pub mod state;
pub mod trace;

pub use error::{AdapterError, EngineError, FlowControlViolation, ParseError, PersistenceError};
pub use observation::{Observation, RangeSet};
pub use orchestrator::{parse_query, Adapter, AdapterSettings};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{AdapterPhase, AdapterStatus};
pub use trace::{Direction, Trace, TraceEvent, TraceRecorder};
