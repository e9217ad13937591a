use crate::rdm::{
  directory::DirectoryRequest, login::LoginRequest, messages::{CloseMsg, GenericMsg, PostMsg, RequestMsg},
};

/// Transport-facing state of the bound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
  Initializing,
  Active,
  Closed,
}

/// Static properties the engine reads once the channel goes active.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
  pub max_fragment_size: u32,
  /// Multicast-capable transport: item messages may arrive sequenced on a
  /// broadcast stream in parallel with the unicast stream.
  pub multicast: bool,
  /// Liveness deadline for fault-tolerance groups, in engine ticks.
  pub ping_timeout: i64,
}

impl Default for ChannelInfo {
  fn default() -> Self {
    Self {
      max_fragment_size: 6144,
      multicast: false,
      ping_timeout: 60_000,
    }
  }
}

/// A message the engine hands to the channel for encoding and transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMsg {
  Login(LoginRequest),
  Directory(DirectoryRequest),
  Request(RequestMsg),
  Close(CloseMsg),
  Generic(GenericMsg),
  Post(PostMsg),
}

/// Result of handing a message to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
  Written,
  /// Written, but the transport wants a flush before more writes.
  WrittenNeedFlush,
  /// Transport is mid-write; resubmit the same message next dispatch.
  CallAgain,
  /// No outbound buffers; flush and re-enter dispatch.
  NoBuffers,
  /// Unrecoverable transport failure.
  Fatal(String),
}

/// Abstract wire channel. The engine only writes; reads are delivered by the
/// host through [`crate::watchlist::Watchlist::read_msg`].
pub trait Channel {
  fn state(&self) -> ChannelState;
  fn info(&self) -> ChannelInfo;
  fn write(&mut self, msg: OutboundMsg) -> WriteOutcome;
}
