//! Shared protocol layer: TLV codec, message families, the mapping frame and
//! the store-backed messaging channel used by every component.

pub mod config;
pub mod defs;
pub mod discovery;
pub mod error;
pub mod ipc;
pub mod messages;
pub mod tlv;
pub mod types;
pub mod wire;

pub use error::{ErrorKind, ProtoError, Result};
pub use messages::{ClientMessage, Directive, Message, ProxyMessage, RouteModType};
pub use tlv::{Action, ActionType, FlowOption, Match, MatchType, OptionType};
pub use types::{DpId, Interface, MacAddress, VmId};
