pub mod browser;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod grounding;
pub mod llm;
pub mod planner;
pub mod prompts;
pub mod recall;
pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod server;
pub mod store;

pub use browser::{BrowserConfig, ChromiumSandbox};
pub use context::{ConversationContext, Message, WindowLimits};
pub use error::{AgentError, StoreError};
pub use event::{Lang, ProgressEvent, Stage};
pub use grounding::{PrimitiveAction, UiTarsGrounder};
pub use llm::{ChatClient, ChatConfig};
pub use planner::{Collaborators, Planner, PlannerConfig, RunReport, TaskOutcome};
pub use registry::TaskRegistry;
pub use runner::{RunnerConfig, ServiceFactory, TaskRequest, TaskRunner};
pub use sandbox::{SandboxClient, SandboxConfig};
pub use store::{InMemoryTaskStore, TaskRecord, TaskStatus, TaskStore};
