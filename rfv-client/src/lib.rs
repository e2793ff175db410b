//! VM-side synchronizer: watches the kernel's routes and neighbors and
//! reports them to the registrar as route directives.

pub mod client;
pub mod error;
pub mod flowtable;
pub mod interfaces;
pub mod kernel;
pub mod mapping;
pub mod probe;
pub mod queue;
pub mod tables;

pub use client::RfClient;
pub use error::{ClientError, Result};
pub use flowtable::{FlowTable, Resolution, Resolver, ResolverConfig};
pub use queue::PendingQueue;
pub use tables::{HostEntry, PendingRoute, RouteEntry, RouteOp};
