use bytes::Bytes;
use enumflags2::{bitflags, BitFlags};

use super::{
  msg_key::MsgKey,
  qos::Qos,
  state::State,
  types::{DomainType, MapEntryAction, NakCode, SymbolListFlags, ViewType},
};

/// Behavior flags of a request message.
///
/// Presence-style wire flags (HAS_QOS, HAS_VIEW, HAS_BATCH, ...) do not
/// appear here; in the decoded model presence is an `Option` on the message.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFlag {
  Streaming = 0x01,
  Pause = 0x02,
  NoRefresh = 0x04,
  PrivateStream = 0x08,
  QualifiedStream = 0x10,
  MsgKeyInUpdates = 0x20,
}

/// Priority of a request: class dominates, count is weight within the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
  pub class: u8,
  pub count: u16,
}

impl Default for Priority {
  fn default() -> Self {
    Self {
      class: 1,
      count: 1,
    }
  }
}

/// A view definition: which projection of the item the request wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewDefinition {
  /// Signed 16-bit field ids. Id 0 is reserved and stripped on intake.
  FieldIdList(Vec<i16>),
  /// ASCII element names.
  ElementNameList(Vec<String>),
}

impl ViewDefinition {
  pub fn view_type(&self) -> ViewType {
    match self {
      ViewDefinition::FieldIdList(_) => ViewType::FieldIdList,
      ViewDefinition::ElementNameList(_) => ViewType::ElementNameList,
    }
  }

  pub fn is_empty(&self) -> bool {
    match self {
      ViewDefinition::FieldIdList(f) => f.is_empty(),
      ViewDefinition::ElementNameList(n) => n.is_empty(),
    }
  }
}

/// One entry of a symbol-list map payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolListEntry {
  pub action: MapEntryAction,
  pub name: String,
}

/// Decoded payload of a provider message, to the extent the engine cares.
///
/// Anything the engine does not interpret stays opaque.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
  #[default]
  None,
  Opaque(Bytes),
  SymbolList(Vec<SymbolListEntry>),
}

/// Consumer request. Also the shape the engine sends upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMsg {
  pub stream_id: i32,
  pub domain: DomainType,
  pub msg_key: MsgKey,
  pub flags: BitFlags<RequestFlag>,
  pub priority: Option<Priority>,
  pub qos: Option<Qos>,
  pub worst_qos: Option<Qos>,
  pub view: Option<ViewDefinition>,
  /// `:ItemList` names of a batch request.
  pub batch_items: Option<Vec<String>>,
  /// `:SymbolListBehaviors` / `:DataStreams` content, symbol lists only.
  pub symbol_list_behaviors: Option<SymbolListFlags>,
  /// Encoded data body not covered by the decoded fields above.
  pub payload: Option<Bytes>,
  pub extended_header: Option<Bytes>,
}

impl RequestMsg {
  pub fn new(stream_id: i32, domain: DomainType, msg_key: MsgKey) -> Self {
    Self {
      stream_id,
      domain,
      msg_key,
      flags: BitFlags::empty(),
      priority: None,
      qos: None,
      worst_qos: None,
      view: None,
      batch_items: None,
      symbol_list_behaviors: None,
      payload: None,
      extended_header: None,
    }
  }

  pub fn is_streaming(&self) -> bool {
    self.flags.contains(RequestFlag::Streaming)
  }

  pub fn is_private(&self) -> bool {
    self.flags.contains(RequestFlag::PrivateStream)
  }

  pub fn is_batch(&self) -> bool {
    self.batch_items.is_some()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshMsg {
  pub stream_id: i32,
  pub domain: DomainType,
  pub msg_key: Option<MsgKey>,
  pub state: State,
  pub solicited: bool,
  pub refresh_complete: bool,
  pub clear_cache: bool,
  pub group_id: Option<Bytes>,
  pub part_num: Option<u16>,
  pub qos: Option<Qos>,
  pub payload: Payload,
}

impl RefreshMsg {
  pub fn new(stream_id: i32, domain: DomainType, state: State) -> Self {
    Self {
      stream_id,
      domain,
      msg_key: None,
      state,
      solicited: false,
      refresh_complete: false,
      clear_cache: false,
      group_id: None,
      part_num: None,
      qos: None,
      payload: Payload::None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMsg {
  pub stream_id: i32,
  pub domain: DomainType,
  pub msg_key: Option<MsgKey>,
  pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMsg {
  pub stream_id: i32,
  pub domain: DomainType,
  pub msg_key: Option<MsgKey>,
  pub state: Option<State>,
  pub group_id: Option<Bytes>,
  pub clear_cache: bool,
}

impl StatusMsg {
  pub fn new(stream_id: i32, domain: DomainType, state: State) -> Self {
    Self {
      stream_id,
      domain,
      msg_key: None,
      state: Some(state),
      group_id: None,
      clear_cache: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseMsg {
  pub stream_id: i32,
  pub domain: DomainType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericMsg {
  pub stream_id: i32,
  pub domain: DomainType,
  pub msg_key: Option<MsgKey>,
  pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostMsg {
  pub stream_id: i32,
  pub domain: DomainType,
  pub msg_key: Option<MsgKey>,
  pub post_id: Option<u32>,
  pub seq_num: Option<u32>,
  pub ack_requested: bool,
  pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMsg {
  pub stream_id: i32,
  pub domain: DomainType,
  pub msg_key: Option<MsgKey>,
  pub ack_id: u32,
  pub seq_num: Option<u32>,
  pub nak_code: Option<NakCode>,
  pub text: Option<String>,
}

/// Any decoded message, consumer- or provider-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
  Request(RequestMsg),
  Refresh(RefreshMsg),
  Update(UpdateMsg),
  Status(StatusMsg),
  Close(CloseMsg),
  Generic(GenericMsg),
  Post(PostMsg),
  Ack(AckMsg),
}

impl Msg {
  pub fn stream_id(&self) -> i32 {
    match self {
      Msg::Request(m) => m.stream_id,
      Msg::Refresh(m) => m.stream_id,
      Msg::Update(m) => m.stream_id,
      Msg::Status(m) => m.stream_id,
      Msg::Close(m) => m.stream_id,
      Msg::Generic(m) => m.stream_id,
      Msg::Post(m) => m.stream_id,
      Msg::Ack(m) => m.stream_id,
    }
  }

  pub fn set_stream_id(&mut self, stream_id: i32) {
    match self {
      Msg::Request(m) => m.stream_id = stream_id,
      Msg::Refresh(m) => m.stream_id = stream_id,
      Msg::Update(m) => m.stream_id = stream_id,
      Msg::Status(m) => m.stream_id = stream_id,
      Msg::Close(m) => m.stream_id = stream_id,
      Msg::Generic(m) => m.stream_id = stream_id,
      Msg::Post(m) => m.stream_id = stream_id,
      Msg::Ack(m) => m.stream_id = stream_id,
    }
  }

  pub fn domain(&self) -> DomainType {
    match self {
      Msg::Request(m) => m.domain,
      Msg::Refresh(m) => m.domain,
      Msg::Update(m) => m.domain,
      Msg::Status(m) => m.domain,
      Msg::Close(m) => m.domain,
      Msg::Generic(m) => m.domain,
      Msg::Post(m) => m.domain,
      Msg::Ack(m) => m.domain,
    }
  }

  /// State carried by the message, if any.
  pub fn state(&self) -> Option<&State> {
    match self {
      Msg::Refresh(m) => Some(&m.state),
      Msg::Status(m) => m.state.as_ref(),
      _ => None,
    }
  }
}
