//! Decoded RDM message model.
//!
//! The watchlist engine does not encode or decode wire formats; it
//! manipulates the decoded shapes in this module and leaves the codec to the
//! surrounding stack. Only the parts of RDM the engine interprets are
//! modeled; everything else travels as opaque [`bytes::Bytes`].

pub mod directory;
pub mod login;
pub mod messages;
pub mod msg_key;
pub mod qos;
pub mod state;
pub mod types;

pub use directory::{
  all_service_filters, DirectoryMsg, DirectoryRefresh, DirectoryRequest, DirectoryStatus,
  DirectoryUpdate, Service, ServiceFilterFlag, ServiceGroupState, ServiceInfo, ServiceLink,
  ServiceLoad, ServiceSpec, ServiceState,
};
pub use login::{LoginMsg, LoginRefresh, LoginRequest, LoginRole, LoginStatus};
pub use messages::{
  AckMsg, CloseMsg, GenericMsg, Msg, Payload, PostMsg, Priority, RefreshMsg, RequestFlag,
  RequestMsg, StatusMsg, SymbolListEntry, UpdateMsg, ViewDefinition,
};
pub use msg_key::MsgKey;
pub use qos::{match_qos, Qos, QosRate, QosTimeliness};
pub use state::{DataState, State, StatusCode, StreamState};
pub use types::{DomainType, FilterId, MapEntryAction, NakCode, SymbolListFlags, ViewType};
