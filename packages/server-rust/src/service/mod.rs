//! Microservice hosting on top of the bus.
//!
//! 1. **Configuration** (`config`, `settings`): per-instance bus settings
//! 2. **Registry** (`registry`): service definitions and implementation factories
//! 3. **Execution** (`operation`, `router`, `middleware`): tower pipeline for one invocation
//! 4. **Provider** (`provider`): inbound request state machine
//! 5. **Caller** (`caller`, `context`): outbound calls and nested-call lineage
//! 6. **Host** (`microservice`, `host`): roles, start/stop lifecycle
//! 7. **Background workers** (`worker`): periodic tasks (reaper, demo executor)

pub mod caller;
pub mod config;
pub mod context;
pub mod host;
pub mod implementation;
pub mod microservice;
pub mod middleware;
pub mod operation;
pub mod provider;
pub mod registry;
pub mod router;
pub mod settings;
pub mod worker;

// Re-export key types for convenient access.
pub use caller::ServiceCaller;
pub use config::{generate_instance_id, BusConfig, INSTANCE_ID_PREFIX};
pub use context::ServiceCallContext;
pub use host::MicroserviceHost;
pub use implementation::ServiceImplementation;
pub use microservice::{Microservice, Roles, StartContext};
pub use operation::{ExecutionError, Invocation};
pub use provider::{RequestProcessor, RequestState};
pub use registry::{ServiceFactories, ServiceFactory, ServiceRegistry};
pub use router::ExecutionRouter;
pub use settings::{EnvSettings, NoopSettings, SettingsProvider, StaticSettings, ENV_PREFIX};
pub use worker::{BackgroundRunnable, BackgroundWorker};
