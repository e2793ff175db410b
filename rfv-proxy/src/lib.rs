//! Switch translator: OpenFlow 1.0 rendering of flow directives, the port
//! pairing table and the controller host that talks to the switches.

pub mod host;
pub mod ofconn;
pub mod openflow;
pub mod portmap;
pub mod proxy;
pub mod translator;

pub use host::{ControllerHost, HostError, HostEvent};
pub use ofconn::OfHost;
pub use portmap::PortMap;
pub use proxy::{Ingress, ProxyError, RfProxy};
pub use translator::TranslateError;
