// Core types and functionality for the Conduit workflow engine

pub mod error;
pub mod functions;
pub mod stats;
pub mod storage;
pub mod template;
pub mod types;
pub mod workflow;

pub use error::{EngineError, EngineResult, StepError, TaskError, TaskErrorKind, ValidationError};
pub use functions::FunctionRegistry;
pub use types::*;
