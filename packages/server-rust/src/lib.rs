//! `meshbus` Server: dispatcher, correlation, admission control, and the
//! microservice host running on a queue transport.

pub mod bootstrap;
pub mod bus;
pub mod demo;
pub mod logging;
pub mod service;

pub use bootstrap::{launch, BootstrapError, MicroserviceCatalog};
pub use bus::{Dispatcher, InMemoryBroker, TaskHandle, Transport};
pub use service::{
    BusConfig, Microservice, MicroserviceHost, Roles, ServiceCallContext, ServiceCaller,
    ServiceImplementation, StartContext,
};
