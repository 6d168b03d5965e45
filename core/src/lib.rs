pub mod activity;
pub mod cancel;
pub mod config;
pub mod connectivity;
pub mod extract;
pub mod gateway;
pub mod llm;
pub mod merge;
pub mod project;
pub mod settings;
pub mod state;
pub mod store;
pub mod stream;
pub mod telemetry;
pub mod versions;


pub use activity::{ActivityLog, LogEntry, LogLevel};
pub use cancel::CancellationToken;
pub use config::{AiConfig, Channel, ConfigRegistry, ModelInstance};
pub use connectivity::{ConnectivityMonitor, HealthStatus, ProbePolicy, Prober};
pub use extract::extract_files;
pub use llm::{ConnectivityReport, GatewayError, LlmDriver, LlmProviderKind};
pub use project::{Project, ProjectFile, ProjectStatus};
pub use settings::RuntimeSettings;
pub use state::{AppState, GenerationReport, WorkspaceError};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use versions::{Version, VersionError};
