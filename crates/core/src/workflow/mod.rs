pub mod builder;
pub mod executor;
pub mod mapper;
pub mod registry;
pub mod step_executor;
pub mod validator;

pub use builder::WorkflowBuilder;
pub use executor::{EngineConfig, ExecuteOptions, WorkflowEngine};
pub use mapper::{extract_input, merge_output};
pub use registry::WorkflowRegistry;
pub use step_executor::{evaluate_condition, StepExecutor, StepOutput, TaskExecutor};
pub use validator::validate;
