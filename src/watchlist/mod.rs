//! The watchlist engine.
//!
//! A single-threaded, cooperatively driven session core: the application
//! submits messages, the host delivers provider messages with [`Watchlist::read_msg`]
//! and calls [`Watchlist::dispatch`] in a loop, and timer work runs when the
//! host invokes [`Watchlist::process_timer`] at (or after) the deadline
//! reported by [`Watchlist::next_timeout`]. The engine never blocks and
//! never spawns threads.

use std::collections::{HashMap, VecDeque};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::rdm::{
  directory::DirectoryMsg,
  login::LoginMsg,
  messages::{AckMsg, CloseMsg, Msg, StatusMsg},
  state::{DataState, State, StatusCode, StreamState},
  types::{DomainType, NakCode},
};

pub mod channel;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod groups;
pub mod items;
pub mod login;
pub mod posts;
pub mod reorder;
pub mod service_cache;
pub mod symbol_list;
pub mod view;

#[cfg(test)]
mod tests;

pub use config::{Ticks, WatchlistConfig, TIME_UNSET};
pub use error::WatchlistError as Error;
pub use events::{EventMsg, MsgEvent};

use channel::{Channel, ChannelInfo, ChannelState, OutboundMsg, WriteOutcome};
use directory::WlDirectoryRequest;
use error::{Result, WatchlistError};
use events::UserHandle;
use groups::FtGroups;
use items::{ItemRequest, ItemStream, StreamAttributes};
use login::WlLogin;
use posts::PostTable;
use service_cache::ServiceCache;

pub const LOGIN_STREAM_ID: i32 = 1;
pub const DIRECTORY_STREAM_ID: i32 = 2;
const FIRST_ITEM_STREAM_ID: i32 = 3;

/// Session bring-up progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
  Start,
  LoginRequested,
  LoggedIn,
  Ready,
  Closed,
}

/// Demand-side service identity: what the application asked for,
/// independent of whether such a service exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceKey {
  Name(String),
  Id(u16),
}

impl ServiceKey {
  pub fn name(&self) -> Option<&str> {
    match self {
      ServiceKey::Name(name) => Some(name),
      ServiceKey::Id(_) => None,
    }
  }
}

/// A requested service: the demand-side record tracking item and directory
/// requests waiting for (or matched to) a service.
#[derive(Debug)]
pub struct WlRequestedService {
  pub key: ServiceKey,
  /// Matching cached service, when one exists.
  pub matching_service: Option<u16>,
  /// Item requests waiting for the service to become usable.
  pub recovering_list: Vec<i32>,
  /// All item requests referencing this requested service.
  pub item_requests: Vec<i32>,
  /// Directory requests awaiting their refresh.
  pub directory_requests: Vec<i32>,
  /// Directory requests already served from cache, receiving updates.
  pub open_directory_requests: Vec<i32>,
}

impl WlRequestedService {
  fn new(key: ServiceKey) -> Self {
    Self {
      key,
      matching_service: None,
      recovering_list: Vec::new(),
      item_requests: Vec::new(),
      directory_requests: Vec::new(),
      open_directory_requests: Vec::new(),
    }
  }

  pub fn is_unused(&self) -> bool {
    self.item_requests.is_empty()
      && self.directory_requests.is_empty()
      && self.open_directory_requests.is_empty()
  }
}

/// Supply-side per-service engine state.
#[derive(Debug)]
pub struct WlService {
  pub service_id: u16,
  /// Item streams open on this service.
  pub open_streams: Vec<i32>,
  pub item_groups: groups::ItemGroups,
  /// Requested-service keys currently matched to this service.
  pub requested_services: Vec<ServiceKey>,
  /// Streams inside the open window, waiting for their refresh.
  pub streams_pending_refresh: Vec<i32>,
  /// Streams waiting for room in the open window.
  pub streams_pending_window: Vec<i32>,
}

impl WlService {
  fn new(service_id: u16) -> Self {
    Self {
      service_id,
      open_streams: Vec::new(),
      item_groups: groups::ItemGroups::default(),
      requested_services: Vec::new(),
      streams_pending_refresh: Vec::new(),
      streams_pending_window: Vec::new(),
    }
  }
}

/// Any application request tracked by stream id.
#[derive(Debug)]
pub enum WlRequest {
  Login,
  Directory(WlDirectoryRequest),
  Item(ItemRequest),
}

/// A stream with an outbound message pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStream {
  Login,
  Directory,
  Item(i32),
  /// Close-only record for a stream the engine does not otherwise know;
  /// guards against a provider close racing a reissue.
  TempClose {
    stream_id: i32,
    domain: DomainType,
  },
}

/// A stream awaiting a provider response, with its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRef {
  Login,
  Directory,
  Item(i32),
}

/// Provider message as delivered by the host: login and directory domain
/// payloads arrive pre-decoded to their RDM forms, everything else as a
/// generic item-domain message.
#[derive(Debug, Clone)]
pub enum InboundMsg {
  Login(LoginMsg),
  Directory(DirectoryMsg),
  Item(Msg),
}

/// Options to [`Watchlist::read_msg`].
#[derive(Debug, Clone)]
pub struct ReadOptions {
  pub msg: InboundMsg,
  pub seq_num: Option<u32>,
  pub ft_group_id: Option<u8>,
}

impl ReadOptions {
  pub fn msg(msg: InboundMsg) -> Self {
    Self {
      msg,
      seq_num: None,
      ft_group_id: None,
    }
  }
}

/// A consumer submission.
#[derive(Debug, Clone)]
pub enum SubmitMsg {
  Login(LoginMsg),
  Directory(DirectoryMsg),
  Item(Msg),
}

/// Options to [`Watchlist::submit_msg`].
#[derive(Debug, Clone)]
pub struct SubmitOptions {
  pub msg: SubmitMsg,
  pub service_name: Option<String>,
  pub user_handle: Option<UserHandle>,
}

/// The watchlist session core.
pub struct Watchlist {
  pub(crate) config: WatchlistConfig,
  pub(crate) channel: Option<Box<dyn Channel>>,
  pub(crate) channel_info: ChannelInfo,
  pub(crate) session_state: SessionState,
  pub(crate) current_time: Ticks,
  pub(crate) need_flush: bool,

  pub(crate) events: VecDeque<MsgEvent>,

  pub(crate) requests: HashMap<i32, WlRequest>,
  pub(crate) new_requests: VecDeque<i32>,

  pub(crate) streams: HashMap<i32, ItemStream>,
  pub(crate) streams_by_attrib: HashMap<StreamAttributes, i32>,
  pub(crate) streams_pending_request: VecDeque<PendingStream>,
  pub(crate) streams_pending_response: VecDeque<(StreamRef, Ticks)>,
  next_stream_id: i32,
  next_provider_request_id: i32,

  pub(crate) requested_services: HashMap<ServiceKey, WlRequestedService>,
  pub(crate) services: HashMap<u16, WlService>,
  pub(crate) service_cache: ServiceCache,

  pub(crate) login: WlLogin,
  pub(crate) directory_requests_all: Vec<i32>,
  pub(crate) directory_stream_open: bool,

  pub(crate) provider_requests_by_attrib: HashMap<items::ProviderRequestKey, i32>,
  pub(crate) ft_groups: FtGroups,
  pub(crate) gap_stream_queue: VecDeque<i32>,
  pub(crate) gap_expire_time: Ticks,
  pub(crate) current_fanout_stream: Option<i32>,

  pub(crate) post_table: PostTable,
  /// Messages accepted but not yet written (transport said call-again or
  /// no-buffers). Drained ahead of new work on each dispatch.
  pub(crate) write_retry: VecDeque<OutboundMsg>,
}

impl Watchlist {
  pub fn new(config: WatchlistConfig) -> Self {
    let hint = config.item_count_hint;
    let max_posts = config.max_outstanding_posts;
    Self {
      config,
      channel: None,
      channel_info: ChannelInfo::default(),
      session_state: SessionState::Start,
      current_time: 0,
      need_flush: false,
      events: VecDeque::new(),
      requests: HashMap::with_capacity(hint),
      new_requests: VecDeque::new(),
      streams: HashMap::with_capacity(hint),
      streams_by_attrib: HashMap::with_capacity(hint),
      streams_pending_request: VecDeque::new(),
      streams_pending_response: VecDeque::new(),
      next_stream_id: FIRST_ITEM_STREAM_ID,
      next_provider_request_id: -1,
      requested_services: HashMap::new(),
      services: HashMap::new(),
      service_cache: ServiceCache::new(),
      login: WlLogin::new(),
      directory_requests_all: Vec::new(),
      directory_stream_open: false,
      provider_requests_by_attrib: HashMap::new(),
      ft_groups: FtGroups::new(),
      gap_stream_queue: VecDeque::new(),
      gap_expire_time: TIME_UNSET,
      current_fanout_stream: None,
      post_table: PostTable::new(max_posts),
      write_retry: VecDeque::new(),
    }
  }

  pub fn config(&self) -> &WatchlistConfig {
    &self.config
  }

  pub fn session_state(&self) -> SessionState {
    self.session_state
  }

  /// True if the engine wants the host to flush the transport and re-enter
  /// dispatch.
  pub fn needs_flush(&self) -> bool {
    self.need_flush
  }

  /// Drains the next event destined for the application.
  pub fn poll_event(&mut self) -> Option<MsgEvent> {
    self.events.pop_front()
  }

  pub(crate) fn emit_event(&mut self, event: MsgEvent) {
    self.events.push_back(event);
  }

  /// Binds or unbinds the wire channel. Unbinding clears the service cache,
  /// which pushes every open item into recovery per single-open policy.
  pub fn bind_channel(&mut self, channel: Option<Box<dyn Channel>>) -> Result<()> {
    match channel {
      Some(channel) => {
        self.channel = Some(channel);
        self.session_state = SessionState::Start;
        self.need_flush = false;
        Ok(())
      }
      None => {
        self.channel = None;
        self.write_retry.clear();
        self.session_state = SessionState::Start;
        let updates = self.service_cache.clear();
        self.apply_service_updates(updates)
      }
    }
  }

  pub(crate) fn take_stream_id(&mut self) -> i32 {
    let id = self.next_stream_id;
    self.next_stream_id += 1;
    id
  }

  pub(crate) fn take_provider_request_id(&mut self) -> i32 {
    let id = self.next_provider_request_id;
    self.next_provider_request_id -= 1;
    id
  }

  // ------------------------------------------------------------------
  // Pending-request / pending-response bookkeeping

  pub(crate) fn set_stream_msg_pending(&mut self, entry: PendingStream) {
    if !self.streams_pending_request.contains(&entry) {
      self.streams_pending_request.push_back(entry);
    }
  }

  pub(crate) fn unset_stream_msg_pending(&mut self, entry: &PendingStream) {
    self.streams_pending_request.retain(|e| e != entry);
  }

  pub(crate) fn set_stream_pending_response(&mut self, stream: StreamRef) {
    self.unset_stream_pending_response(&stream);
    let deadline = self.current_time + self.config.request_timeout;
    self.streams_pending_response.push_back((stream, deadline));
  }

  pub(crate) fn unset_stream_pending_response(&mut self, stream: &StreamRef) {
    self.streams_pending_response.retain(|(s, _)| s != stream);
  }

  // ------------------------------------------------------------------
  // Requested services

  pub(crate) fn requested_service_mut(&mut self, key: &ServiceKey) -> &mut WlRequestedService {
    self
      .requested_services
      .entry(key.clone())
      .or_insert_with(|| {
        let mut requested = WlRequestedService::new(key.clone());
        // Match immediately if the service is already known.
        requested.matching_service = match key {
          ServiceKey::Name(name) => self.service_cache.id_by_name(name),
          ServiceKey::Id(id) => self.service_cache.get(*id).map(|_| *id),
        };
        requested
      })
  }

  /// Drops a requested service once nothing references it.
  pub(crate) fn check_requested_service_ref_count(&mut self, key: &ServiceKey) {
    let remove = self
      .requested_services
      .get(key)
      .is_some_and(|r| r.is_unused());
    if remove {
      if let Some(requested) = self.requested_services.remove(key) {
        if let Some(service_id) = requested.matching_service {
          if let Some(service) = self.services.get_mut(&service_id) {
            service.requested_services.retain(|k| k != key);
          }
        }
      }
    }
  }

  // ------------------------------------------------------------------
  // Dispatch (the per-tick driver)

  /// Runs one engine tick: activates new requests, advances session
  /// bring-up, retries stalled writes and flushes pending stream messages.
  /// Returns true when more work is immediately pending.
  pub fn dispatch(&mut self, now: Ticks) -> Result<bool> {
    self.current_time = now;
    self.need_flush = false;

    while let Some(request_id) = self.new_requests.pop_front() {
      match self.requests.get(&request_id) {
        Some(WlRequest::Directory(_)) => self.activate_directory_request(request_id)?,
        Some(WlRequest::Item(_)) => self.activate_item_request(request_id)?,
        Some(WlRequest::Login) | None => (),
      }
    }

    let Some(channel) = self.channel.as_ref() else {
      return Ok(false);
    };

    match channel.state() {
      ChannelState::Initializing => return Ok(false),
      ChannelState::Active => {
        if self.session_state == SessionState::Start {
          self.channel_info = channel.info();
          // Start by logging in.
          if self.login.stream_open {
            self.set_stream_msg_pending(PendingStream::Login);
          }
        }
      }
      ChannelState::Closed => {
        self.write_retry.clear();
        self.channel = None;
        self.session_state = SessionState::Start;
        // Clearing the cache pushes all open items back into recovery.
        let updates = self.service_cache.clear();
        self.apply_service_updates(updates)?;
        return Ok(false);
      }
    }

    // Retry stalled writes before sending anything new.
    while let Some(retry) = self.write_retry.pop_front() {
      match self.write_now(retry) {
        WriteResult::Done => (),
        WriteResult::Stashed => {
          self.need_flush = true;
          return Ok(false);
        }
        WriteResult::NoBuffers(msg) => {
          self.write_retry.push_front(msg);
          self.need_flush = true;
          return Ok(false);
        }
        WriteResult::Fatal(text) => return Err(WatchlistError::TransportFatal(text)),
      }
    }

    // Send pending stream messages.
    while let Some(entry) = self.streams_pending_request.front().cloned() {
      match self.stream_submit_msg(&entry)? {
        StreamSubmitOutcome::Sent => (),
        StreamSubmitOutcome::NeedFlush => {
          self.need_flush = true;
          return Ok(false);
        }
      }
    }

    Ok(!self.streams_pending_request.is_empty() || !self.new_requests.is_empty())
  }

  pub(crate) fn write_now(&mut self, msg: OutboundMsg) -> WriteResult {
    let Some(channel) = self.channel.as_mut() else {
      // No channel; drop the message. The streams are already headed for
      // recovery via the cache clear.
      return WriteResult::Done;
    };
    match channel.write(msg.clone()) {
      WriteOutcome::Written => WriteResult::Done,
      WriteOutcome::WrittenNeedFlush => {
        self.need_flush = true;
        WriteResult::Done
      }
      WriteOutcome::CallAgain => {
        // Transport took partial ownership; retry this exact message first
        // on the next dispatch. Logically the message counts as sent.
        self.write_retry.push_front(msg);
        self.need_flush = true;
        WriteResult::Stashed
      }
      WriteOutcome::NoBuffers => {
        self.need_flush = true;
        WriteResult::NoBuffers(msg)
      }
      WriteOutcome::Fatal(text) => {
        error!("channel write failed: {text}");
        WriteResult::Fatal(text)
      }
    }
  }

  /// Write path for consumer-submitted generic/post traffic: a transient
  /// buffer shortage queues the message instead of failing the submit.
  pub(crate) fn write_or_queue(&mut self, msg: OutboundMsg) -> Result<()> {
    match self.write_now(msg) {
      WriteResult::Done | WriteResult::Stashed => Ok(()),
      WriteResult::NoBuffers(msg) => {
        self.write_retry.push_back(msg);
        Ok(())
      }
      WriteResult::Fatal(text) => Err(WatchlistError::TransportFatal(text)),
    }
  }

  // ------------------------------------------------------------------
  // Timers

  /// Earliest pending deadline, if any.
  pub fn next_timeout(&self) -> Option<Ticks> {
    let mut time = TIME_UNSET;
    if let Some((_, deadline)) = self.streams_pending_response.front() {
      time = time.min(*deadline);
    }
    if let Some(deadline) = self.ft_groups.next_timeout() {
      time = time.min(deadline);
    }
    if let Some(deadline) = self.post_table.next_timeout() {
      time = time.min(deadline);
    }
    time = time.min(self.gap_expire_time);
    (time != TIME_UNSET).then_some(time)
  }

  /// Processes every deadline at or before `now`. Idempotent for times
  /// below all deadlines.
  pub fn process_timer(&mut self, now: Ticks) -> Result<()> {
    self.current_time = now;

    if self.streams_pending_response.is_empty()
      && self.ft_groups.is_empty()
      && self.gap_stream_queue.is_empty()
      && self.post_table.is_empty()
    {
      return Ok(());
    }

    // Request timeouts.
    while let Some((stream, deadline)) = self.streams_pending_response.front().copied() {
      if deadline > now {
        break;
      }
      self.streams_pending_response.pop_front();
      let state = State::closed_recover_suspect()
        .with_code(StatusCode::Timeout)
        .with_text("Request timed out.");
      match stream {
        StreamRef::Login => self.process_login_timeout(state)?,
        StreamRef::Directory => self.process_directory_timeout()?,
        StreamRef::Item(stream_id) => {
          let domain = match self.streams.get(&stream_id) {
            Some(s) => s.domain,
            None => continue,
          };
          let mut status = StatusMsg::new(stream_id, domain, state);
          status.clear_cache = false;
          let event = items::ItemMsgEvent::status_with_close(status);
          self.fanout_item_msg_event(stream_id, event)?;
          self.current_fanout_stream = None;
        }
      }
    }

    // FT group timeouts.
    while let Some((ft_group_id, stream_ids)) = self.ft_groups.peek_expired(now) {
      debug!("FT group {ft_group_id} timed out");
      for stream_id in stream_ids {
        if !self.streams.contains_key(&stream_id) {
          continue;
        }
        let domain = self.streams[&stream_id].domain;
        let state = State::closed_recover_suspect()
          .with_code(StatusCode::Timeout)
          .with_text("Fault-tolerant Group timeout.");
        let event = items::ItemMsgEvent::status_with_close(StatusMsg::new(stream_id, domain, state));
        self.fanout_item_msg_event(stream_id, event)?;
        self.current_fanout_stream = None;
      }
      self.ft_groups.remove_group(ft_group_id);
    }

    // Gap timer.
    if self.gap_expire_time <= now {
      while let Some(stream_id) = self.gap_stream_queue.front().copied() {
        if self.config.gap_recovery {
          let Some(stream) = self.streams.get(&stream_id) else {
            self.gap_stream_queue.pop_front();
            continue;
          };
          let domain = stream.domain;
          let state = State::closed_recover_suspect()
            .with_code(StatusCode::GapDetected)
            .with_text("Gap in sequence number.");
          let event =
            items::ItemMsgEvent::status_with_close(StatusMsg::new(stream_id, domain, state));
          self.fanout_item_msg_event(stream_id, event)?;
          self.current_fanout_stream = None;
        } else {
          // Gap recovery off: the stream is here because broadcast fell
          // behind unicast. Assume the missing messages are lost and drain
          // the buffer.
          self.drain_reorder_buffer(stream_id)?;
          if self.current_fanout_stream.take().is_none() && !self.streams.contains_key(&stream_id) {
            continue;
          }
          self.unset_gap_timer(stream_id, items::StreamFlag::BcBehindUc);
        }
      }
    }

    // Post acknowledgement timeouts.
    while let Some(record) = self.post_table.pop_expired(now) {
      let ack = AckMsg {
        stream_id: record.key.stream_id,
        domain: record.domain,
        msg_key: None,
        ack_id: record.key.post_id,
        seq_num: record.key.seq_num,
        nak_code: Some(NakCode::NoResponse),
        text: Some("Acknowledgement timed out.".to_string()),
      };
      match record.owner {
        posts::PostOwner::Item(request_id) => {
          if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
            request.open_posts.retain(|k| *k != record.key);
          } else {
            continue;
          }
          let event = items::ItemMsgEvent::msg(Msg::Ack(ack));
          self.send_msg_event_to_item_request(event, request_id)?;
        }
        posts::PostOwner::Login => {
          self.login.open_posts.retain(|k| *k != record.key);
          self.deliver_offstream_ack(ack);
        }
      }
    }

    // Re-arm the gap timer if gap streams remain.
    if self.gap_stream_queue.is_empty() {
      self.gap_expire_time = TIME_UNSET;
    } else {
      self.gap_expire_time = self.current_time + self.config.gap_timeout;
    }

    Ok(())
  }

  /// Records a fault-tolerance group ping; returns the group's new expiry.
  pub fn process_ft_group_ping(&mut self, ft_group_id: u8, now: Ticks) -> Option<Ticks> {
    self.current_time = now;
    self
      .ft_groups
      .process_ping(ft_group_id, now, self.channel_info.ping_timeout)
  }

  /// Host hint that the transport recovered; push the gap deadline forward.
  pub fn reset_gap_timer(&mut self, now: Ticks) {
    if self.gap_expire_time == TIME_UNSET {
      return;
    }
    self.gap_expire_time = now + self.config.gap_timeout;
  }

  // ------------------------------------------------------------------
  // Provider messages

  /// Processes one provider message. Returns true when the engine has
  /// pending work (the host should call dispatch).
  pub fn read_msg(&mut self, options: ReadOptions, now: Ticks) -> Result<bool> {
    self.current_time = now;

    match options.msg {
      InboundMsg::Login(login_msg) => self.process_login_provider_msg(login_msg)?,
      InboundMsg::Directory(directory_msg) => {
        self.process_directory_provider_msg(directory_msg)?;
      }
      InboundMsg::Item(msg) => self.read_item_msg(msg, options.seq_num, options.ft_group_id)?,
    }

    Ok(!self.streams_pending_request.is_empty() || !self.new_requests.is_empty())
  }

  fn read_item_msg(
    &mut self,
    msg: Msg,
    seq_num: Option<u32>,
    ft_group_id: Option<u8>,
  ) -> Result<()> {
    let stream_id = msg.stream_id();

    // Off-stream messages addressed to the login stream.
    if stream_id == LOGIN_STREAM_ID {
      return self.read_login_offstream_msg(msg);
    }

    let known = if stream_id != 0 {
      self.streams.contains_key(&stream_id).then_some(stream_id)
    } else {
      // Broadcast messages carry no stream id; match the key to a stream.
      self.match_broadcast_stream(&msg)
    };

    let Some(stream_id) = known else {
      // Likely a message racing a consumer close. If the provider closed
      // the stream, send a close upstream so a recent reissue is not
      // misread as a new request. Never for broadcast messages.
      if msg.stream_id() != 0 {
        if let Some(state) = msg.state() {
          if state.stream_state != StreamState::Open {
            self.set_stream_msg_pending(PendingStream::TempClose {
              stream_id: msg.stream_id(),
              domain: msg.domain(),
            });
          }
        }
      }
      return Ok(());
    };

    let event = items::ItemMsgEvent {
      msg,
      seq_num,
      ft_group_id,
      flags: Default::default(),
    };

    let is_private = self.streams[&stream_id].has_flag(items::StreamFlag::Private);

    if event.seq_num.is_none() {
      self.fanout_item_msg_event(stream_id, event)?;
      self.current_fanout_stream = None;
    } else if !is_private {
      self.current_fanout_stream = Some(stream_id);
      self.order_msg(stream_id, event)?;
      self.current_fanout_stream = None;
    } else {
      self.read_private_sequenced_msg(stream_id, event)?;
    }
    Ok(())
  }

  // ------------------------------------------------------------------
  // Consumer submissions

  /// Accepts a consumer message. Returns true when the engine has pending
  /// work.
  pub fn submit_msg(&mut self, options: SubmitOptions, now: Ticks) -> Result<bool> {
    self.current_time = now;

    match options.msg {
      SubmitMsg::Login(LoginMsg::Request(request)) => {
        self.submit_login_request(request, options.user_handle)?;
      }
      SubmitMsg::Login(_) => {
        return Err(WatchlistError::invalid_argument(
          "Unsupported login message type.",
        ));
      }
      SubmitMsg::Directory(DirectoryMsg::Request(request)) => {
        self.submit_directory_request(request, options.user_handle)?;
      }
      SubmitMsg::Directory(_) => {
        return Err(WatchlistError::invalid_argument(
          "Unsupported Directory RDM message type.",
        ));
      }
      SubmitMsg::Item(msg) => self.submit_item_msg(msg, options.service_name, options.user_handle)?,
    }

    Ok(!self.streams_pending_request.is_empty() || !self.new_requests.is_empty())
  }

  fn submit_item_msg(
    &mut self,
    msg: Msg,
    service_name: Option<String>,
    user_handle: Option<UserHandle>,
  ) -> Result<()> {
    match msg {
      Msg::Request(request) => self.process_item_request(request, service_name, user_handle),
      Msg::Close(close) => self.process_consumer_close(close),
      Msg::Generic(generic) => self.process_consumer_generic(generic, service_name),
      Msg::Post(post) => self.process_consumer_post(post, service_name),
      other => Err(WatchlistError::invalid_argument(format!(
        "Unsupported consumer message class {other:?}."
      ))),
    }
  }

  fn process_consumer_close(&mut self, close: CloseMsg) -> Result<()> {
    let stream_id = close.stream_id;
    match self.requests.get(&stream_id) {
      Some(WlRequest::Item(_)) => self.close_item_request_by_consumer(stream_id),
      Some(WlRequest::Directory(_)) => {
        self.close_directory_request(stream_id);
        Ok(())
      }
      Some(WlRequest::Login) => self.close_login_by_consumer(),
      None => Err(WatchlistError::invalid_argument(format!(
        "Close requested for unknown stream {stream_id}."
      ))),
    }
  }

  // ------------------------------------------------------------------
  // Teardown

  /// Fans a closed-suspect status to every open request and tears down all
  /// tables.
  pub fn destroy(&mut self) {
    let request_ids: Vec<i32> = self.requests.keys().copied().collect();
    for request_id in request_ids {
      match self.requests.remove(&request_id) {
        Some(WlRequest::Item(request)) => {
          let state = State::new(StreamState::Closed, DataState::Suspect);
          let status = StatusMsg::new(request_id, request.domain, state);
          let mut event = MsgEvent::item(Msg::Status(status));
          event.stream_info.user_handle = request.user_handle;
          event.stream_info.service_name = request.service_key.name().map(str::to_string);
          self.emit_event(event);
        }
        Some(WlRequest::Directory(request)) => {
          let state = State::new(StreamState::Closed, DataState::Suspect);
          let status = crate::rdm::directory::DirectoryStatus {
            stream_id: request_id,
            state: Some(state),
          };
          let mut event = MsgEvent::directory(DirectoryMsg::Status(status));
          event.stream_info.user_handle = request.user_handle;
          self.emit_event(event);
        }
        Some(WlRequest::Login) => {
          let login_info = self
            .login
            .request
            .as_ref()
            .map(|r| (r.request.stream_id, r.user_handle));
          if let Some((stream_id, user_handle)) = login_info {
            let state = State::new(StreamState::Closed, DataState::Suspect);
            let status = crate::rdm::login::LoginStatus {
              stream_id,
              state: Some(state),
            };
            let mut event = MsgEvent::login(LoginMsg::Status(status));
            event.stream_info.user_handle = user_handle;
            self.emit_event(event);
          }
        }
        None => (),
      }
    }

    self.streams.clear();
    self.streams_by_attrib.clear();
    self.streams_pending_request.clear();
    self.streams_pending_response.clear();
    self.requested_services.clear();
    self.services.clear();
    self.provider_requests_by_attrib.clear();
    self.ft_groups.clear();
    self.gap_stream_queue.clear();
    self.gap_expire_time = TIME_UNSET;
    self.post_table.clear();
    self.new_requests.clear();
    self.login = WlLogin::new();
    self.directory_requests_all.clear();
    self.directory_stream_open = false;
    self.write_retry.clear();
    self.channel = None;
    self.session_state = SessionState::Closed;
    info!("watchlist destroyed");
  }
}

/// Internal classification of a channel write attempt.
pub(crate) enum WriteResult {
  Done,
  /// Call-again: stashed for retry, counts as sent.
  Stashed,
  /// Not sent; the message is handed back to the caller.
  NoBuffers(OutboundMsg),
  Fatal(String),
}

/// Outcome of submitting one pending stream's message.
pub(crate) enum StreamSubmitOutcome {
  Sent,
  NeedFlush,
}
