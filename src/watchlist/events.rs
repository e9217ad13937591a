use enumflags2::{bitflags, BitFlags};

use crate::rdm::{directory::DirectoryMsg, login::LoginMsg, messages::Msg};

/// Opaque per-request handle the application supplied on submit; echoed on
/// every event for that request.
pub type UserHandle = u64;

/// Flags qualifying a delivered event.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlag {
  /// The host should close the upstream stream for this message.
  SendClose = 0x01,
  /// Status synthesized for notification only.
  NotifyStatus = 0x02,
}

/// Identity of the request an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamInfo {
  pub service_name: Option<String>,
  pub user_handle: Option<UserHandle>,
}

/// Message payload of an event: decoded item-domain message, or a typed
/// login/directory RDM message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventMsg {
  Item(Msg),
  Login(LoginMsg),
  Directory(DirectoryMsg),
}

/// One event emitted to the application.
///
/// Events are queued inside the engine and drained with
/// [`crate::watchlist::Watchlist::poll_event`] after each engine call; the
/// application must not call back into the engine while holding an event it
/// has not finished processing for the same stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgEvent {
  pub msg: EventMsg,
  pub stream_info: StreamInfo,
  pub seq_num: Option<u32>,
  pub ft_group_id: Option<u8>,
  pub flags: BitFlags<EventFlag>,
}

impl MsgEvent {
  pub fn item(msg: Msg) -> Self {
    Self {
      msg: EventMsg::Item(msg),
      stream_info: StreamInfo::default(),
      seq_num: None,
      ft_group_id: None,
      flags: BitFlags::empty(),
    }
  }

  pub fn login(msg: LoginMsg) -> Self {
    Self {
      msg: EventMsg::Login(msg),
      stream_info: StreamInfo::default(),
      seq_num: None,
      ft_group_id: None,
      flags: BitFlags::empty(),
    }
  }

  pub fn directory(msg: DirectoryMsg) -> Self {
    Self {
      msg: EventMsg::Directory(msg),
      stream_info: StreamInfo::default(),
      seq_num: None,
      ft_group_id: None,
      flags: BitFlags::empty(),
    }
  }

  /// Item message carried by this event, if it is an item event.
  pub fn item_msg(&self) -> Option<&Msg> {
    match &self.msg {
      EventMsg::Item(msg) => Some(msg),
      _ => None,
    }
  }
}
