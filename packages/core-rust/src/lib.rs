//! `meshbus` Core: service call envelope, call lineage, queue topology, and wire codec.

pub mod call;
pub mod clock;
pub mod codec;
pub mod definition;
pub mod result;
pub mod topology;
pub mod types;

pub use call::{Ancestors, CorrelationKey, ServiceCall, ServiceCallDestination, ServiceCallSource};
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use definition::{ServiceAddress, ServiceDefinition, DEFAULT_VERSION, LATEST_VERSION};
pub use result::{CallFailure, FailureKind, ServiceCallResult};
pub use topology::{QueueTopology, DYNAMIC_DESTINATION_HEADER};
pub use types::{data_object, DataObject};
