pub mod registry;
pub mod server;

pub use registry::{AssociationRecord, FieldFilter, RecordQuery, Registry, RegistryError};
pub use server::RfServer;
