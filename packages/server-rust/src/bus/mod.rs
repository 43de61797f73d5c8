//! Bus dispatch engine.
//!
//! 1. **Transport** (`transport`, `memory`): queue port and in-process broker
//! 2. **Admission** (`admission`): per-instance in-flight limit
//! 3. **Correlation** (`correlation`): pending call handles and timeout reaper
//! 4. **Dispatcher** (`dispatcher`): send/receive paths and consumer loops
//! 5. **Shutdown** (`shutdown`): health state and drain coordination

pub mod admission;
pub mod correlation;
pub mod dispatcher;
pub mod memory;
pub mod shutdown;
pub mod transport;

pub use admission::{AdmissionControl, AdmissionPermit};
pub use correlation::{CorrelationTable, PendingCallReaper, ReaperTask, TaskCompletion, TaskHandle};
pub use dispatcher::{DispatchError, Dispatcher, InboundHandler};
pub use memory::InMemoryBroker;
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
pub use transport::{
    Delivery, DeliveryTag, Envelope, QueueConsumer, QueueOptions, Transport, TransportError,
};
