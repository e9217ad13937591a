use bytes::Bytes;
use enumflags2::{bitflags, BitFlags};

use super::{
  qos::Qos,
  state::State,
  types::MapEntryAction,
};

/// Source directory filter bits. Bit n corresponds to filter id n+1.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFilterFlag {
  Info = 0x01,
  State = 0x02,
  Group = 0x04,
  Load = 0x08,
  Data = 0x10,
  Link = 0x20,
}

pub fn all_service_filters() -> BitFlags<ServiceFilterFlag> {
  BitFlags::all()
}

/// Info filter entry of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceInfo {
  pub service_name: String,
  pub vendor: Option<String>,
  /// Supported domains, kept sorted for binary search.
  pub capabilities: Vec<u16>,
  /// Offered QoS, best first.
  pub qos_list: Vec<Qos>,
  pub dictionaries_provided: Vec<String>,
  pub dictionaries_used: Vec<String>,
  pub supports_qos_range: bool,
  pub supports_out_of_band_snapshots: bool,
  pub item_list: Option<String>,
}

/// State filter entry of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
  /// Nonzero means the service is up.
  pub service_state: u8,
  pub accepting_requests: bool,
  pub status: Option<State>,
}

impl Default for ServiceState {
  fn default() -> Self {
    // Per RDM, absent state filter means up and accepting.
    Self {
      service_state: 1,
      accepting_requests: true,
      status: None,
    }
  }
}

/// Load filter entry of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceLoad {
  pub open_limit: Option<u64>,
  pub open_window: Option<u64>,
  pub load_factor: Option<u64>,
}

/// One group-state entry from the group filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceGroupState {
  pub group: Bytes,
  pub merged_to_group: Option<Bytes>,
  pub status: Option<State>,
}

/// One link filter entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLink {
  pub name: String,
  pub link_state: u8,
  pub text: Option<String>,
}

/// A service as carried in a directory refresh/update.
///
/// A `None` filter section is absent from the message; fanout filtering
/// clears sections the requesting application did not subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
  pub service_id: u16,
  pub action: MapEntryAction,
  pub info: Option<ServiceInfo>,
  pub state: Option<ServiceState>,
  pub load: Option<ServiceLoad>,
  pub group_states: Vec<ServiceGroupState>,
  pub data: Option<Bytes>,
  pub links: Vec<ServiceLink>,
}

impl Service {
  pub fn new(service_id: u16, action: MapEntryAction) -> Self {
    Self {
      service_id,
      action,
      info: None,
      state: None,
      load: None,
      group_states: Vec::new(),
      data: None,
      links: Vec::new(),
    }
  }

  /// Drops every filter section the given filter does not select.
  pub fn apply_filter(&self, filter: BitFlags<ServiceFilterFlag>) -> Service {
    let mut filtered = self.clone();
    if !filter.contains(ServiceFilterFlag::Info) {
      filtered.info = None;
    }
    if !filter.contains(ServiceFilterFlag::State) {
      filtered.state = None;
    }
    if !filter.contains(ServiceFilterFlag::Group) {
      filtered.group_states.clear();
    }
    if !filter.contains(ServiceFilterFlag::Load) {
      filtered.load = None;
    }
    if !filter.contains(ServiceFilterFlag::Data) {
      filtered.data = None;
    }
    if !filter.contains(ServiceFilterFlag::Link) {
      filtered.links.clear();
    }
    filtered
  }
}

/// Which services a directory request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ServiceSpec {
  #[default]
  All,
  ById(u16),
  ByName(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRequest {
  pub stream_id: i32,
  pub filter: BitFlags<ServiceFilterFlag>,
  pub service: ServiceSpec,
  pub streaming: bool,
}

impl DirectoryRequest {
  pub fn all_services(stream_id: i32) -> Self {
    Self {
      stream_id,
      filter: all_service_filters(),
      service: ServiceSpec::All,
      streaming: true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRefresh {
  pub stream_id: i32,
  pub state: State,
  pub solicited: bool,
  pub filter: BitFlags<ServiceFilterFlag>,
  pub service_id: Option<u16>,
  pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUpdate {
  pub stream_id: i32,
  pub filter: BitFlags<ServiceFilterFlag>,
  pub service_id: Option<u16>,
  pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryStatus {
  pub stream_id: i32,
  pub state: Option<State>,
}

/// Any RDM directory-domain message the engine handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryMsg {
  Request(DirectoryRequest),
  Refresh(DirectoryRefresh),
  Update(DirectoryUpdate),
  Status(DirectoryStatus),
}

impl DirectoryMsg {
  pub fn state(&self) -> Option<&State> {
    match self {
      DirectoryMsg::Refresh(refresh) => Some(&refresh.state),
      DirectoryMsg::Status(status) => status.state.as_ref(),
      _ => None,
    }
  }

  pub fn set_stream_id(&mut self, stream_id: i32) {
    match self {
      DirectoryMsg::Request(m) => m.stream_id = stream_id,
      DirectoryMsg::Refresh(m) => m.stream_id = stream_id,
      DirectoryMsg::Update(m) => m.stream_id = stream_id,
      DirectoryMsg::Status(m) => m.stream_id = stream_id,
    }
  }
}
