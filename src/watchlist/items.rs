//! Item stream engine: request aggregation, stream lifecycle, refresh
//! fanout, recovery, sequencing and post/generic gating.

use bytes::Bytes;
use enumflags2::{bitflags, BitFlags};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::rdm::{
  match_qos,
  messages::{GenericMsg, Msg, PostMsg, Priority, RequestFlag, RequestMsg, StatusMsg, ViewDefinition},
  msg_key::MsgKey,
  qos::Qos,
  state::{DataState, State, StreamState},
  types::{DomainType, SymbolListFlags},
};

use super::{
  channel::OutboundMsg,
  config::TIME_UNSET,
  error::{Result, WatchlistError},
  events::{EventFlag, MsgEvent, UserHandle},
  posts::{PostKey, PostOwner, PostRecord},
  reorder::{next_seq, prev_seq, seq_compare, BufferedMsg, ReorderQueue},
  view::{AggregateView, ViewHandle},
  PendingStream, ServiceKey, StreamRef, StreamSubmitOutcome, Watchlist, WlRequest, WriteResult,
  LOGIN_STREAM_ID,
};

/// Where a request currently lives. The owning queue is derived from this
/// state plus the attached stream / requested service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
  /// On the engine's new-requests queue, awaiting activation.
  New,
  /// On its requested service's recovering list, awaiting a usable service.
  ServiceRecovering,
  /// On its stream's recovering queue, waiting to send a request.
  StreamRecovering,
  /// On its stream's pending-refresh queue.
  PendingRefresh,
  /// On its stream's open queue.
  Open,
}

/// Refresh lifecycle of an item stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
  /// No refresh needed.
  Idle,
  /// Needs to request a refresh, but the service OpenWindow is full.
  PendingOpenWindow,
  /// Needs to request a refresh.
  RequestRefresh,
  /// Waiting for a refresh.
  PendingRefresh,
  /// Received a partial refresh, waiting for the rest.
  PendingRefreshComplete,
}

/// Per-stream state bits.
#[bitflags]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFlag {
  /// Stream is currently waiting for a snapshot.
  PendingSnapshot = 0x0001,
  /// Stream is currently paused.
  Paused = 0x0002,
  /// Stream needs to change priority.
  PendingPriorityChange = 0x0004,
  /// Stream's view is currently active.
  Viewed = 0x0008,
  /// Stream needs to update its view.
  PendingViewChange = 0x0010,
  /// Stream is expecting a refresh that changes the view.
  PendingViewRefresh = 0x0020,
  Private = 0x0040,
  /// Open/Ok received after refresh complete; permits posts/generics.
  Established = 0x0080,
  /// `seq_num` holds the last received broadcast sequence number.
  HasBcSeqNum = 0x0100,
  /// `seq_num` holds the first unicast sequence number.
  HasUcSeqNum = 0x0200,
  /// Gap detected in the broadcast sequence.
  HasBcSeqGap = 0x0400,
  /// Gap detected in refresh part numbers.
  HasPartGap = 0x0800,
  /// Broadcast stream is behind the unicast stream.
  BcBehindUc = 0x1000,
  /// `bc_synch_seq_num` holds a broadcast synchronization point.
  HasBcSynchSeqNum = 0x2000,
  /// No upstream close needs to be sent when closing this stream.
  Closed = 0x4000,
  Qualified = 0x8000,
}

const GAP_FLAGS: u16 =
  StreamFlag::HasBcSeqGap as u16 | StreamFlag::HasPartGap as u16 | StreamFlag::BcBehindUc as u16;

fn gap_flags() -> BitFlags<StreamFlag> {
  BitFlags::from_bits_truncate(GAP_FLAGS)
}

/// Per-request state bits.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemRequestFlag {
  /// Request has established a static QoS.
  HasStaticQos = 0x01,
  Private = 0x02,
  /// Provider-driven (symbol-list data stream); unique among such requests.
  ProvDriven = 0x04,
  /// Request has received a full refresh.
  Refreshed = 0x08,
  /// Batch acknowledgement stub.
  Batch = 0x10,
  /// Provider-driven request that has received a message with a key.
  HasProvKey = 0x20,
  Qualified = 0x40,
}

/// Symbol-list specifics carried by a symbol-list item request.
#[derive(Debug, Clone, Copy)]
pub struct SymbolListAttrs {
  pub has_behaviors: bool,
  pub flags: SymbolListFlags,
}

/// One application item subscription.
#[derive(Debug)]
pub struct ItemRequest {
  pub stream_id: i32,
  pub domain: DomainType,
  pub user_handle: Option<UserHandle>,
  pub state: RequestState,
  pub flags: BitFlags<ItemRequestFlag>,
  pub request_flags: BitFlags<RequestFlag>,
  pub msg_key: MsgKey,
  pub service_key: ServiceKey,
  pub priority: Priority,
  pub qos: Option<Qos>,
  pub worst_qos: Option<Qos>,
  pub static_qos: Option<Qos>,
  pub view: Option<ViewDefinition>,
  pub view_handle: Option<ViewHandle>,
  /// Payload / extended header, retained for private streams only.
  pub payload: Option<Bytes>,
  pub extended_header: Option<Bytes>,
  /// Upstream stream this request is attached to.
  pub stream: Option<i32>,
  pub open_posts: Vec<PostKey>,
  pub symbol_list: Option<SymbolListAttrs>,
}

impl ItemRequest {
  pub fn is_streaming(&self) -> bool {
    self.request_flags.contains(RequestFlag::Streaming)
  }

  pub fn is_paused(&self) -> bool {
    self.request_flags.contains(RequestFlag::Pause)
  }

  pub fn is_private(&self) -> bool {
    self.flags.contains(ItemRequestFlag::Private)
  }
}

/// Attributes shared by all requests aggregated onto one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAttributes {
  pub domain: DomainType,
  pub msg_key: MsgKey,
  pub qos: Qos,
}

/// Key identifying a provider-driven request, for duplicate suppression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderRequestKey {
  pub domain: DomainType,
  pub qos: Qos,
  pub name: String,
  pub service: ServiceKey,
}

/// One upstream conversation.
#[derive(Debug)]
pub struct ItemStream {
  pub stream_id: i32,
  pub domain: DomainType,
  pub attributes: StreamAttributes,
  pub service_id: u16,
  pub flags: BitFlags<StreamFlag>,
  pub refresh_state: RefreshState,
  /// Last priority sent upstream.
  pub priority: Priority,
  pub recovering: Vec<i32>,
  pub pending_refresh: Vec<i32>,
  pub open: Vec<i32>,
  pub streaming_count: u32,
  pub paused_count: u32,
  pub view_count: u32,
  pub aggregate_view: Option<AggregateView>,
  pub item_group: Option<Bytes>,
  pub ft_group: Option<u8>,
  pub reorder: ReorderQueue,
  pub seq_num: u32,
  pub bc_synch_seq_num: u32,
  pub next_part_num: u16,
  pub closing: bool,
  /// Private-stream request whose payload/extended header rides on the
  /// next outbound request.
  pub request_with_extra_info: Option<i32>,
}

impl ItemStream {
  fn new(stream_id: i32, attributes: StreamAttributes, service_id: u16) -> Self {
    Self {
      stream_id,
      domain: attributes.domain,
      attributes,
      service_id,
      flags: BitFlags::empty(),
      refresh_state: RefreshState::Idle,
      // Zero so the first aggregate priority always counts as a change.
      priority: Priority { class: 0, count: 0 },
      recovering: Vec::new(),
      pending_refresh: Vec::new(),
      open: Vec::new(),
      streaming_count: 0,
      paused_count: 0,
      view_count: 0,
      aggregate_view: None,
      item_group: None,
      ft_group: None,
      reorder: ReorderQueue::new(),
      seq_num: 0,
      bc_synch_seq_num: 0,
      next_part_num: 0,
      closing: false,
      request_with_extra_info: None,
    }
  }

  pub fn has_flag(&self, flag: StreamFlag) -> bool {
    self.flags.contains(flag)
  }

  pub fn request_count(&self) -> usize {
    self.recovering.len() + self.pending_refresh.len() + self.open.len()
  }

  pub fn has_requests(&self) -> bool {
    self.request_count() != 0
  }
}

/// Internal form of a message traveling through item fanout.
#[derive(Debug, Clone)]
pub struct ItemMsgEvent {
  pub msg: Msg,
  pub seq_num: Option<u32>,
  pub ft_group_id: Option<u8>,
  pub flags: BitFlags<EventFlag>,
}

impl ItemMsgEvent {
  pub fn msg(msg: Msg) -> Self {
    Self {
      msg,
      seq_num: None,
      ft_group_id: None,
      flags: BitFlags::empty(),
    }
  }

  /// Synthesized status whose delivery obliges the host to close upstream.
  pub fn status_with_close(status: StatusMsg) -> Self {
    Self {
      msg: Msg::Status(status),
      seq_num: None,
      ft_group_id: None,
      flags: EventFlag::SendClose.into(),
    }
  }
}

impl Watchlist {
  // ==================================================================
  // Submission

  /// Handles a consumer item request: open, reissue, or batch.
  pub(crate) fn process_item_request(
    &mut self,
    request: RequestMsg,
    service_name: Option<String>,
    user_handle: Option<UserHandle>,
  ) -> Result<()> {
    match self.requests.get(&request.stream_id) {
      Some(WlRequest::Item(_)) => self.reissue_item_request(request, service_name),
      Some(_) => Err(WatchlistError::invalid_argument(
        "Domain type does not match existing request.",
      )),
      None => self.open_item_request(request, service_name, user_handle),
    }
  }

  fn open_item_request(
    &mut self,
    request: RequestMsg,
    service_name: Option<String>,
    user_handle: Option<UserHandle>,
  ) -> Result<()> {
    if request.flags.contains(RequestFlag::NoRefresh) {
      return Err(WatchlistError::invalid_data(
        "Cannot open request without requesting refresh.",
      ));
    }
    if request.stream_id < 0 {
      return Err(WatchlistError::invalid_data(
        "Cannot open request with negative stream ID.",
      ));
    }
    if request.msg_key.has_service_id() && service_name.is_some() {
      return Err(WatchlistError::invalid_data(
        "Cannot open request with both service ID and service name.",
      ));
    }
    if let Some(qos) = &request.qos {
      if !qos.is_specified() {
        return Err(WatchlistError::invalid_data(format!(
          "Request has invalid QoS (Timeliness: {}, Rate: {}).",
          qos.timeliness as u8, qos.rate as u8
        )));
      }
    }
    if let Some(worst) = &request.worst_qos {
      if !worst.is_specified() {
        return Err(WatchlistError::invalid_data(format!(
          "Request has invalid worst QoS (Timeliness: {}, Rate: {}).",
          worst.timeliness as u8, worst.rate as u8
        )));
      }
    }

    let service_key = match (&service_name, request.msg_key.service_id) {
      (Some(name), None) => ServiceKey::Name(name.clone()),
      (None, Some(id)) => ServiceKey::Id(id),
      (None, None) => {
        return Err(WatchlistError::invalid_data(
          "Item request contained no service name nor service ID.",
        ));
      }
      (Some(_), Some(_)) => unreachable!(), // rejected above
    };

    let symbol_list = if request.domain == DomainType::SymbolList {
      let flags = request.symbol_list_behaviors.unwrap_or_default();
      if flags.data_streams() && flags.data_snapshots() {
        return Err(WatchlistError::invalid_data(
          "Symbol list request specifies both data streams and data snapshots.",
        ));
      }
      Some(SymbolListAttrs {
        has_behaviors: request.symbol_list_behaviors.is_some(),
        flags,
      })
    } else {
      None
    };

    if request.is_batch() {
      return self.process_item_batch_request(request, service_key, user_handle);
    }

    self.create_item_request(request, service_key, user_handle, BitFlags::empty(), symbol_list)
  }

  /// Expands a batch request into sibling requests plus an
  /// acknowledgement stub.
  fn process_item_batch_request(
    &mut self,
    request: RequestMsg,
    service_key: ServiceKey,
    user_handle: Option<UserHandle>,
  ) -> Result<()> {
    if request.msg_key.has_name() {
      return Err(WatchlistError::invalid_data(
        "Requested batch has name in message key.",
      ));
    }
    let items = request.batch_items.clone().unwrap_or_default();

    // Verify no collision before creating anything.
    for (index, _) in items.iter().enumerate() {
      let sibling_id = request.stream_id + 1 + index as i32;
      if self.requests.contains_key(&sibling_id) {
        return Err(WatchlistError::invalid_data(
          "Item in batch has same ID as existing stream.",
        ));
      }
    }

    let mut created: Vec<i32> = Vec::with_capacity(items.len());
    for (index, name) in items.iter().enumerate() {
      let mut sibling = request.clone();
      sibling.stream_id = request.stream_id + 1 + index as i32;
      sibling.batch_items = None;
      sibling.msg_key.name = Some(name.clone());

      let result = self.create_item_request(
        sibling,
        service_key.clone(),
        user_handle,
        BitFlags::empty(),
        None,
      );
      match result {
        Ok(()) => created.push(request.stream_id + 1 + index as i32),
        Err(e) => {
          // Roll back the expansion.
          for id in created {
            self.abort_new_item_request(id);
          }
          return Err(e);
        }
      }
    }

    // The stub only exists to be acknowledged on the next dispatch.
    let mut stub = request;
    stub.batch_items = None;
    self.create_item_request(
      stub,
      service_key,
      user_handle,
      ItemRequestFlag::Batch.into(),
      None,
    )
  }

  pub(crate) fn create_item_request(
    &mut self,
    request: RequestMsg,
    service_key: ServiceKey,
    user_handle: Option<UserHandle>,
    extra_flags: BitFlags<ItemRequestFlag>,
    symbol_list: Option<SymbolListAttrs>,
  ) -> Result<()> {
    let stream_id = request.stream_id;
    let mut flags = extra_flags;
    if request.flags.contains(RequestFlag::PrivateStream) {
      flags |= ItemRequestFlag::Private;
    }
    if request.flags.contains(RequestFlag::QualifiedStream) {
      flags |= ItemRequestFlag::Qualified;
    }

    let is_private = flags.contains(ItemRequestFlag::Private);
    // The data body is kept only when it is not view/batch/symbol-list
    // behavior content; the extended header is kept for any private stream.
    let retain_payload = is_private
      && (flags.contains(ItemRequestFlag::Qualified)
        || (request.view.is_none()
          && !request.is_batch()
          && symbol_list.map_or(true, |sl| !sl.has_behaviors)));

    let item_request = ItemRequest {
      stream_id,
      domain: request.domain,
      user_handle,
      state: RequestState::New,
      flags,
      request_flags: request.flags,
      msg_key: request.msg_key,
      service_key: service_key.clone(),
      priority: request.priority.unwrap_or_default(),
      qos: request.qos,
      worst_qos: request.worst_qos,
      static_qos: None,
      view: request.view,
      view_handle: None,
      payload: retain_payload.then_some(request.payload).flatten(),
      extended_header: is_private.then_some(request.extended_header).flatten(),
      stream: None,
      open_posts: Vec::new(),
      symbol_list,
    };

    self.requested_service_mut(&service_key).item_requests.push(stream_id);
    self.requests.insert(stream_id, WlRequest::Item(item_request));
    self.new_requests.push_back(stream_id);
    trace!("item request {stream_id} created");
    Ok(())
  }

  /// Removes a just-created request during batch rollback.
  fn abort_new_item_request(&mut self, request_id: i32) {
    if let Some(WlRequest::Item(request)) = self.requests.remove(&request_id) {
      self.new_requests.retain(|id| *id != request_id);
      if let Some(requested) = self.requested_services.get_mut(&request.service_key) {
        requested.item_requests.retain(|id| *id != request_id);
      }
      self.check_requested_service_ref_count(&request.service_key);
    }
  }

  /// Reissue of an existing item request.
  fn reissue_item_request(&mut self, request: RequestMsg, service_name: Option<String>) -> Result<()> {
    let Some(WlRequest::Item(existing)) = self.requests.get(&request.stream_id) else {
      unreachable!()
    };

    if request.domain != existing.domain {
      return Err(WatchlistError::invalid_argument(
        "Domain type does not match existing request.",
      ));
    }
    if request.is_batch() {
      return Err(WatchlistError::invalid_argument(
        "Request reissue may not contain batch flag.",
      ));
    }
    if !existing.is_streaming() {
      return Err(WatchlistError::invalid_argument(
        "Snapshot requests may not be reissued.",
      ));
    }
    // A pause-only reissue (PAUSE without STREAMING) is how an item is
    // paused; only dropping both counts as removing the streaming flag.
    if existing.is_streaming()
      && !request.flags.contains(RequestFlag::Streaming)
      && !request.flags.contains(RequestFlag::Pause)
    {
      return Err(WatchlistError::invalid_argument(
        "Request reissue may not remove streaming flag.",
      ));
    }
    if request.flags.contains(RequestFlag::PrivateStream) && !existing.is_private() {
      return Err(WatchlistError::invalid_argument(
        "Request reissue may not add private stream flag.",
      ));
    }
    match (&service_name, &existing.service_key) {
      (Some(name), ServiceKey::Name(existing_name)) => {
        if name != existing_name {
          return Err(WatchlistError::invalid_argument(
            "Service name does not match existing request.",
          ));
        }
      }
      (None, ServiceKey::Id(existing_id)) => {
        if request.msg_key.service_id.is_some_and(|id| id != *existing_id) {
          return Err(WatchlistError::invalid_argument(
            "Service ID does not match existing request.",
          ));
        }
      }
      _ => {
        return Err(WatchlistError::invalid_argument(
          "Service name does not match existing request.",
        ));
      }
    }
    let key_matches = if existing.service_key.name().is_some() {
      request.msg_key.matches_ignoring_service(&existing.msg_key)
    } else {
      request.msg_key == existing.msg_key
    };
    if !key_matches {
      return Err(WatchlistError::invalid_argument(
        "Message key does not match existing request.",
      ));
    }
    if request.qos != existing.qos && existing.static_qos.is_none() {
      return Err(WatchlistError::invalid_argument(
        "QoS does not match existing request.",
      ));
    }
    if request.worst_qos != existing.worst_qos && existing.static_qos.is_none() {
      return Err(WatchlistError::invalid_argument(
        "Worst QoS does not match existing request.",
      ));
    }

    let stream_id = existing.stream.clone();
    if let (Some(view), Some(sid)) = (&request.view, stream_id) {
      if let Some(aggregate) = self.streams.get(&sid).and_then(|s| s.aggregate_view.as_ref()) {
        if aggregate.view_type() != view.view_type() {
          return Err(WatchlistError::invalid_argument(
            "Requested view type does not match existing stream.",
          ));
        }
      }
    }

    // Validation passed; apply the changes.
    let request_id = request.stream_id;
    let was_paused;
    let now_paused;
    let view_changed;
    {
      let Some(WlRequest::Item(existing)) = self.requests.get_mut(&request_id) else {
        unreachable!()
      };
      was_paused = existing.is_paused();
      now_paused = request.flags.contains(RequestFlag::Pause);
      view_changed = existing.view != request.view;

      existing.priority = request.priority.unwrap_or(existing.priority);
      let mut incoming_flags = request.flags;
      if existing.is_streaming() && !incoming_flags.contains(RequestFlag::Streaming) {
        // Pause-only reissue; the request stays streaming.
        incoming_flags |= RequestFlag::Streaming;
      }
      existing.request_flags = incoming_flags;
      if let Some(sl) = existing.symbol_list.as_mut() {
        if let Some(behaviors) = request.symbol_list_behaviors {
          sl.flags = behaviors;
          sl.has_behaviors = true;
        }
      }
      if existing.is_private() {
        if request.payload.is_some() {
          existing.payload = request.payload.clone();
        }
        if request.extended_header.is_some() {
          existing.extended_header = request.extended_header.clone();
        }
      }
    }

    let Some(sid) = stream_id else {
      // Not attached yet (still recovering); the stored changes apply when
      // the request next finds a stream.
      if let Some(WlRequest::Item(existing)) = self.requests.get_mut(&request_id) {
        if view_changed {
          existing.view = request.view;
        }
      }
      return Ok(());
    };

    {
      let stream = self.streams.get_mut(&sid).expect("attached stream exists");
      stream.flags |= StreamFlag::PendingPriorityChange;
      if was_paused != now_paused {
        if now_paused {
          stream.paused_count += 1;
        } else {
          stream.paused_count = stream.paused_count.saturating_sub(1);
        }
      }
    }

    if view_changed {
      self.replace_request_view(request_id, request.view.clone())?;
    }

    let private = {
      let Some(WlRequest::Item(existing)) = self.requests.get(&request_id) else {
        unreachable!()
      };
      existing.is_private()
    };
    if private && (request.payload.is_some() || request.extended_header.is_some()) {
      if let Some(stream) = self.streams.get_mut(&sid) {
        stream.request_with_extra_info = Some(request_id);
      }
    }

    // A reissue asking for a refresh goes back through the refresh cycle.
    let wants_refresh = !request.flags.contains(RequestFlag::NoRefresh);
    self.attach_request_to_stream_queues(sid, request_id, wants_refresh)
  }

  fn replace_request_view(&mut self, request_id: i32, new_view: Option<ViewDefinition>) -> Result<()> {
    let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) else {
      return Ok(());
    };
    let old_handle = request.view_handle.take();
    let had_view = request.view.is_some();
    request.view = new_view;
    let has_view = request.view.is_some();
    let stream_id = request.stream;

    let Some(sid) = stream_id else { return Ok(()) };
    let Some(stream) = self.streams.get_mut(&sid) else {
      return Ok(());
    };

    if let Some(handle) = old_handle {
      if let Some(aggregate) = stream.aggregate_view.as_mut() {
        aggregate.remove(handle);
      }
      if had_view {
        stream.view_count = stream.view_count.saturating_sub(1);
      }
    }
    if has_view {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        unreachable!()
      };
      let view = request.view.clone().expect("checked above");
      let aggregate = stream
        .aggregate_view
        .get_or_insert_with(|| AggregateView::new(view.view_type()));
      let handle = aggregate.add(&view);
      stream.view_count += 1;
      if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
        request.view_handle = Some(handle);
      }
    }
    if let Some(stream) = self.streams.get_mut(&sid) {
      stream.flags |= StreamFlag::PendingViewChange;
    }
    Ok(())
  }

  // ==================================================================
  // Activation and stream finding

  /// Activates one request from the new-requests queue.
  pub(crate) fn activate_item_request(&mut self, request_id: i32) -> Result<()> {
    let (is_batch, service_key, domain, user_handle) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      (
        request.flags.contains(ItemRequestFlag::Batch),
        request.service_key.clone(),
        request.domain,
        request.user_handle,
      )
    };

    if is_batch {
      // Batch stubs are acknowledged and destroyed.
      let state = State::new(StreamState::Closed, DataState::Ok)
        .with_text("Batch request acknowledged.");
      let status = StatusMsg::new(request_id, domain, state);
      let mut event = MsgEvent::item(Msg::Status(status));
      event.stream_info.user_handle = user_handle;
      event.stream_info.service_name = service_key.name().map(str::to_string);
      self.emit_event(event);

      if let Some(requested) = self.requested_services.get_mut(&service_key) {
        requested.item_requests.retain(|id| *id != request_id);
      }
      self.requests.remove(&request_id);
      self.check_requested_service_ref_count(&service_key);
      return Ok(());
    }

    // Move onto the requested service's recovering list and look for a
    // stream.
    if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
      request.state = RequestState::ServiceRecovering;
    }
    self
      .requested_service_mut(&service_key)
      .recovering_list
      .push(request_id);
    self.find_stream_for_request(request_id, true)
  }

  /// Attempts to find (or create) a stream for a request whose service may
  /// now be usable. `generate_status` controls whether a rejection
  /// produces a synthetic status.
  pub(crate) fn find_stream_for_request(
    &mut self,
    request_id: i32,
    generate_status: bool,
  ) -> Result<()> {
    let (service_key, domain, qos, worst_qos, static_qos, is_private, is_qualified, has_extra) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      (
        request.service_key.clone(),
        request.domain,
        request.qos,
        request.worst_qos,
        request.static_qos,
        request.is_private(),
        request.flags.contains(ItemRequestFlag::Qualified),
        request.payload.is_some() || request.extended_header.is_some(),
      )
    };

    let matching = self
      .requested_services
      .get(&service_key)
      .and_then(|r| r.matching_service);

    let rejection: Option<&'static str> = 'check: {
      let Some(service_id) = matching else {
        break 'check Some("No matching service present.");
      };
      let Some(cached) = self.service_cache.get(service_id) else {
        break 'check Some("No matching service present.");
      };
      if !cached.has_capability(domain as u16) {
        break 'check Some("Domain not supported by service.");
      }
      if cached.state.service_state == 0 {
        break 'check Some("Service is down.");
      }
      if !cached.state.accepting_requests {
        break 'check Some("Service is not accepting requests.");
      }
      let offered = &cached.info.qos_list;
      let effective_qos = static_qos.or(qos);
      let effective_worst = if static_qos.is_some() { None } else { worst_qos };
      let matched = if offered.is_empty() && effective_qos.is_none() {
        // Service with no advertised QoS serves default realtime.
        Some(Qos::realtime_tick_by_tick())
      } else {
        match_qos(effective_qos.as_ref(), effective_worst.as_ref(), offered).copied()
      };
      if matched.is_none() {
        break 'check Some("Service does not provide a matching QoS.");
      }
      None
    };

    if let Some(text) = rejection {
      if generate_status {
        self.reject_item_request(request_id, text)?;
      }
      return Ok(());
    }

    let service_id = matching.expect("checked above");
    let cached = self.service_cache.get(service_id).expect("checked above");
    let offered = cached.info.qos_list.clone();
    let effective_qos = static_qos.or(qos);
    let effective_worst = if static_qos.is_some() { None } else { worst_qos };
    let matched_qos = if offered.is_empty() && effective_qos.is_none() {
      Qos::realtime_tick_by_tick()
    } else {
      *match_qos(effective_qos.as_ref(), effective_worst.as_ref(), &offered).expect("checked above")
    };

    let mut msg_key = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      request.msg_key.clone()
    };
    msg_key.service_id = Some(service_id);
    let attributes = StreamAttributes {
      domain,
      msg_key,
      qos: matched_qos,
    };

    let stream_id = if !is_private {
      self.streams_by_attrib.get(&attributes).copied()
    } else {
      None
    };

    let stream_id = match stream_id {
      Some(id) => id,
      None => {
        let id = self.take_stream_id();
        let mut stream = ItemStream::new(id, attributes.clone(), service_id);
        if is_private {
          stream.flags |= StreamFlag::Private;
          if is_qualified {
            stream.flags |= StreamFlag::Qualified;
          }
          if has_extra {
            stream.request_with_extra_info = Some(request_id);
          }
        } else {
          self.streams_by_attrib.insert(attributes, id);
        }
        self.streams.insert(id, stream);
        self
          .services
          .entry(service_id)
          .or_insert_with(|| super::WlService::new(service_id))
          .open_streams
          .push(id);
        debug!("item stream {id} created on service {service_id}");
        id
      }
    };

    // Leave the recovering list; the stream queues take over.
    if let Some(requested) = self.requested_services.get_mut(&service_key) {
      requested.recovering_list.retain(|id| *id != request_id);
    }

    self.add_request_to_stream(stream_id, request_id)
  }

  /// Rejection of a request no service can currently satisfy: suspect-open
  /// under single-open, closed-recover otherwise.
  fn reject_item_request(&mut self, request_id: i32, text: &str) -> Result<()> {
    let (domain, is_private) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      (request.domain, request.is_private())
    };

    if self.config.single_open && !is_private {
      let state = State::open_suspect().with_text(text);
      let status = StatusMsg::new(request_id, domain, state);
      self.send_msg_event_to_item_request(ItemMsgEvent::msg(Msg::Status(status)), request_id)
      // The request remains on the recovering list.
    } else {
      let state = State::closed_recover_suspect().with_text(text);
      let status = StatusMsg::new(request_id, domain, state);
      self.close_item_request(request_id);
      self.send_msg_event_to_item_request(ItemMsgEvent::msg(Msg::Status(status)), request_id)?;
      self.destroy_item_request(request_id);
      Ok(())
    }
  }

  /// Attaches a request to a stream for the first time.
  pub(crate) fn add_request_to_stream(&mut self, stream_id: i32, request_id: i32) -> Result<()> {
    let (view, is_streaming, is_paused) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      (request.view.clone(), request.is_streaming(), request.is_paused())
    };

    // Views of different types cannot share a stream.
    if let Some(view) = &view {
      let mismatch = self
        .streams
        .get(&stream_id)
        .and_then(|s| s.aggregate_view.as_ref())
        .is_some_and(|agg| agg.view_type() != view.view_type());
      if mismatch {
        let (domain, _) = {
          let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
            return Ok(());
          };
          (request.domain, ())
        };
        let state = State::closed_recover_suspect()
          .with_text("Requested view type does not match existing stream.");
        let status = StatusMsg::new(request_id, domain, state);
        self.close_item_request(request_id);
        self.send_msg_event_to_item_request(ItemMsgEvent::msg(Msg::Status(status)), request_id)?;
        self.destroy_item_request(request_id);
        return Ok(());
      }
    }

    {
      let stream = self.streams.get_mut(&stream_id).expect("stream exists");
      if is_streaming {
        stream.streaming_count += 1;
        if is_paused {
          stream.paused_count += 1;
        }
      }
      stream.flags |= StreamFlag::PendingPriorityChange;
    }

    if let Some(view) = view {
      let stream = self.streams.get_mut(&stream_id).expect("stream exists");
      let aggregate = stream
        .aggregate_view
        .get_or_insert_with(|| AggregateView::new(view.view_type()));
      let handle = aggregate.add(&view);
      stream.view_count += 1;
      stream.flags |= StreamFlag::PendingViewChange;
      if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
        request.view_handle = Some(handle);
      }
    }

    if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
      request.stream = Some(stream_id);
    }

    self.attach_request_to_stream_queues(stream_id, request_id, true)
  }

  /// Chooses the state queue for a request joining (or rejoining) its
  /// stream and schedules the outbound request as needed.
  fn attach_request_to_stream_queues(
    &mut self,
    stream_id: i32,
    request_id: i32,
    wants_refresh: bool,
  ) -> Result<()> {
    let (is_streaming, view, in_queue) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      let in_queue = matches!(
        request.state,
        RequestState::StreamRecovering | RequestState::PendingRefresh | RequestState::Open
      );
      (request.is_streaming(), request.view.clone(), in_queue)
    };

    // A reissue that needs a new image leaves its current queue first.
    let mut queued = in_queue;
    if in_queue && wants_refresh {
      let idle = self.streams.get(&stream_id).is_some_and(|s| s.refresh_state == RefreshState::Idle);
      if idle {
        self.remove_request_from_state_queue(request_id);
        queued = false;
      }
    }

    if !queued {
      let decision = {
        let stream = self.streams.get(&stream_id).expect("stream exists");
        let wait_for_current = stream.refresh_state == RefreshState::PendingRefreshComplete
          || (is_streaming && stream.has_flag(StreamFlag::PendingSnapshot))
          || (stream.has_flag(StreamFlag::PendingViewRefresh)
            && match (&view, stream.aggregate_view.as_ref()) {
              (Some(v), Some(agg)) => !agg.contains(v),
              _ => true,
            });
        if wait_for_current {
          0
        } else if !stream.pending_refresh.is_empty() {
          1
        } else {
          2
        }
      };
      match decision {
        0 => {
          // Wait for the current refresh cycle to finish.
          let stream = self.streams.get_mut(&stream_id).expect("stream exists");
          stream.recovering.push(request_id);
          if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
            request.state = RequestState::StreamRecovering;
          }
          return Ok(());
        }
        1 => {
          // Join the refresh already in flight.
          let stream = self.streams.get_mut(&stream_id).expect("stream exists");
          stream.pending_refresh.push(request_id);
          if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
            request.state = RequestState::PendingRefresh;
          }
          self.item_stream_set_msg_pending(stream_id, false);
        }
        _ => {
          let stream = self.streams.get_mut(&stream_id).expect("stream exists");
          stream.recovering.push(request_id);
          if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
            request.state = RequestState::StreamRecovering;
          }
          self.item_stream_set_msg_pending(stream_id, true);
        }
      }
    } else {
      self.item_stream_set_msg_pending(stream_id, false);
    }
    Ok(())
  }

  // ==================================================================
  // Request/queue bookkeeping

  /// Removes a request from whatever state queue holds it.
  pub(crate) fn remove_request_from_state_queue(&mut self, request_id: i32) {
    let (state, stream, service_key) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return;
      };
      (request.state, request.stream, request.service_key.clone())
    };
    match state {
      RequestState::New => self.new_requests.retain(|id| *id != request_id),
      RequestState::ServiceRecovering => {
        if let Some(requested) = self.requested_services.get_mut(&service_key) {
          requested.recovering_list.retain(|id| *id != request_id);
        }
      }
      RequestState::StreamRecovering | RequestState::PendingRefresh | RequestState::Open => {
        if let Some(stream) = stream.and_then(|sid| self.streams.get_mut(&sid)) {
          stream.recovering.retain(|id| *id != request_id);
          stream.pending_refresh.retain(|id| *id != request_id);
          stream.open.retain(|id| *id != request_id);
        }
      }
    }
  }

  /// Detaches a request from its stream, adjusting counts and views.
  pub(crate) fn remove_request_from_stream(&mut self, request_id: i32) {
    let (stream_id, is_streaming, is_paused, view_handle, had_view) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return;
      };
      let Some(sid) = request.stream else { return };
      (
        sid,
        request.is_streaming(),
        request.is_paused(),
        request.view_handle,
        request.view.is_some(),
      )
    };
    let Some(stream) = self.streams.get_mut(&stream_id) else {
      return;
    };
    if stream.request_with_extra_info == Some(request_id) {
      stream.request_with_extra_info = None;
    }
    if is_streaming {
      stream.streaming_count = stream.streaming_count.saturating_sub(1);
      if is_paused {
        stream.paused_count = stream.paused_count.saturating_sub(1);
      }
    }
    if let Some(handle) = view_handle {
      if let Some(aggregate) = stream.aggregate_view.as_mut() {
        aggregate.remove(handle);
      }
      if had_view {
        stream.view_count = stream.view_count.saturating_sub(1);
      }
      stream.flags |= StreamFlag::PendingViewChange;
    }
    stream.flags |= StreamFlag::PendingPriorityChange;

    self.remove_request_from_state_queue(request_id);
    if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
      request.stream = None;
      request.view_handle = None;
    }
  }

  /// Closes a request: detach from queues, stream and post table. The
  /// request object survives until [`Self::destroy_item_request`] so a
  /// final status can still be delivered.
  pub(crate) fn close_item_request(&mut self, request_id: i32) {
    let attached = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return;
      };
      request.stream.is_some()
    };
    if attached {
      self.remove_request_from_stream(request_id);
    } else {
      self.remove_request_from_state_queue(request_id);
    }
    self.post_table.remove_owner(PostOwner::Item(request_id));
    if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
      request.open_posts.clear();
    }
    if let Some(WlRequest::Item(request)) = self.requests.get(&request_id) {
      let key = request.service_key.clone();
      if let Some(requested) = self.requested_services.get_mut(&key) {
        requested.item_requests.retain(|id| *id != request_id);
      }
    }
  }

  pub(crate) fn destroy_item_request(&mut self, request_id: i32) {
    if let Some(WlRequest::Item(request)) = self.requests.remove(&request_id) {
      if request.flags.contains(ItemRequestFlag::ProvDriven) {
        self
          .provider_requests_by_attrib
          .retain(|_, id| *id != request_id);
      }
      let key = request.service_key;
      self.check_requested_service_ref_count(&key);
    }
  }

  /// Application-initiated close of one item request.
  pub(crate) fn close_item_request_by_consumer(&mut self, request_id: i32) -> Result<()> {
    let stream_id = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Err(WatchlistError::invalid_argument(format!(
          "Close requested for unknown stream {request_id}."
        )));
      };
      request.stream
    };
    self.close_item_request(request_id);
    self.destroy_item_request(request_id);

    if let Some(sid) = stream_id {
      let empty = self.streams.get(&sid).is_some_and(|s| !s.has_requests());
      if empty {
        self.item_stream_close(sid);
      } else if self.streams.contains_key(&sid) {
        // Remaining requests need the priority (and possibly view) change
        // sent upstream.
        self.item_stream_set_msg_pending(sid, false);
      }
    }
    Ok(())
  }

  // ==================================================================
  // Priority

  /// Aggregate priority across streaming requests: max class wins, counts
  /// sum within the winning class.
  pub(crate) fn merge_priority(&self, stream: &ItemStream) -> Option<Priority> {
    let mut merged: Option<Priority> = None;
    for request_id in stream
      .recovering
      .iter()
      .chain(stream.pending_refresh.iter())
      .chain(stream.open.iter())
    {
      let Some(WlRequest::Item(request)) = self.requests.get(request_id) else {
        continue;
      };
      if !request.is_streaming() {
        continue;
      }
      merged = Some(match merged {
        None => request.priority,
        Some(current) => {
          if request.priority.class > current.class {
            request.priority
          } else if request.priority.class == current.class {
            Priority {
              class: current.class,
              count: current.count + request.priority.count,
            }
          } else {
            current
          }
        }
      });
    }
    merged
  }

  // ==================================================================
  // Message-pending / open window

  /// Marks an item stream as needing to send a request, honoring the
  /// service's open window when a refresh is being solicited.
  pub(crate) fn item_stream_set_msg_pending(&mut self, stream_id: i32, request_refresh: bool) {
    let Some(stream) = self.streams.get(&stream_id) else {
      return;
    };
    let refresh_state = stream.refresh_state;
    let service_id = stream.service_id;

    if request_refresh && refresh_state == RefreshState::Idle {
      let window_full = self.config.obey_open_window
        && self
          .service_cache
          .get(service_id)
          .and_then(|s| s.load.open_window)
          .is_some_and(|window| {
            self
              .services
              .get(&service_id)
              .map(|s| s.streams_pending_refresh.len() as u64 >= window)
              .unwrap_or(false)
          });
      if window_full {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
          stream.refresh_state = RefreshState::PendingOpenWindow;
        }
        if let Some(service) = self.services.get_mut(&service_id) {
          service.streams_pending_window.push(stream_id);
        }
        trace!("stream {stream_id} waiting for open window");
        return;
      }
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.refresh_state = RefreshState::RequestRefresh;
      }
      if let Some(service) = self.services.get_mut(&service_id) {
        service.streams_pending_refresh.push(stream_id);
      }
      self.set_stream_msg_pending(PendingStream::Item(stream_id));
    } else if refresh_state != RefreshState::PendingOpenWindow {
      self.set_stream_msg_pending(PendingStream::Item(stream_id));
    }
  }

  pub(crate) fn item_stream_unset_msg_pending(&mut self, stream_id: i32) {
    self.unset_stream_msg_pending(&PendingStream::Item(stream_id));
  }

  /// Promotes waiters when room opens in a service's open window.
  pub(crate) fn check_open_window(&mut self, service_id: u16) {
    loop {
      let Some(service) = self.services.get(&service_id) else {
        return;
      };
      if service.streams_pending_window.is_empty() {
        return;
      }
      let window = self
        .service_cache
        .get(service_id)
        .and_then(|s| s.load.open_window);
      let has_room = match window {
        Some(window) => (service.streams_pending_refresh.len() as u64) < window,
        None => true,
      };
      if !has_room {
        return;
      }
      let Some(service) = self.services.get_mut(&service_id) else {
        return;
      };
      let waiting = service.streams_pending_window.remove(0);
      if let Some(stream) = self.streams.get_mut(&waiting) {
        stream.refresh_state = RefreshState::Idle;
      }
      self.item_stream_set_msg_pending(waiting, true);
    }
  }

  /// A complete refresh ends the stream's refresh cycle and may free an
  /// open-window slot.
  pub(crate) fn process_refresh_complete(&mut self, stream_id: i32) {
    let Some(stream) = self.streams.get_mut(&stream_id) else {
      return;
    };
    if !matches!(
      stream.refresh_state,
      RefreshState::PendingRefresh | RefreshState::PendingRefreshComplete
    ) {
      return;
    }
    stream.refresh_state = RefreshState::Idle;
    let service_id = stream.service_id;
    if let Some(service) = self.services.get_mut(&service_id) {
      service.streams_pending_refresh.retain(|id| *id != stream_id);
    }
    self.check_open_window(service_id);
  }

  // ==================================================================
  // Stream close

  /// Detaches a stream from every table; sends an upstream close unless
  /// the stream state already closed it.
  pub(crate) fn item_stream_close(&mut self, stream_id: i32) {
    let Some(stream) = self.streams.get_mut(&stream_id) else {
      return;
    };
    let service_id = stream.service_id;
    let flags = stream.flags;
    let item_group = stream.item_group.take();
    let ft_group = stream.ft_group.take();
    let refresh_state = stream.refresh_state;
    stream.refresh_state = RefreshState::Idle;
    let is_private = flags.contains(StreamFlag::Private);
    let attributes = stream.attributes.clone();

    if let Some(service) = self.services.get_mut(&service_id) {
      service.open_streams.retain(|id| *id != stream_id);
      match refresh_state {
        RefreshState::PendingOpenWindow => {
          service.streams_pending_window.retain(|id| *id != stream_id);
        }
        RefreshState::Idle => (),
        _ => service.streams_pending_refresh.retain(|id| *id != stream_id),
      }
      if let Some(group_id) = &item_group {
        service.item_groups.remove_stream(group_id, stream_id);
      }
    }
    if let Some(ft) = ft_group {
      self.ft_groups.remove_stream(ft, stream_id);
    }
    if !is_private {
      self.streams_by_attrib.remove(&attributes);
    }
    if flags.intersects(gap_flags()) {
      self.gap_stream_queue.retain(|id| *id != stream_id);
      if self.gap_stream_queue.is_empty() {
        self.gap_expire_time = TIME_UNSET;
      }
    }
    self.check_open_window(service_id);
    self.unset_stream_pending_response(&StreamRef::Item(stream_id));

    if self.current_fanout_stream == Some(stream_id) {
      self.current_fanout_stream = None;
    }

    if !flags.contains(StreamFlag::Closed) {
      // Keep the stream record around until the close message goes out.
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.closing = true;
      }
      self.set_stream_msg_pending(PendingStream::Item(stream_id));
    } else {
      self.item_stream_unset_msg_pending(stream_id);
      self.streams.remove(&stream_id);
      trace!("item stream {stream_id} destroyed");
    }
  }

  // ==================================================================
  // Outbound request construction

  /// Sends the pending message of one stream. Pops the pending entry on
  /// success; leaves it in place when the transport is out of buffers.
  pub(crate) fn stream_submit_msg(&mut self, entry: &PendingStream) -> Result<StreamSubmitOutcome> {
    match entry {
      PendingStream::Login => self.submit_login_stream_msg(),
      PendingStream::Directory => self.submit_directory_stream_msg(),
      PendingStream::TempClose { stream_id, domain } => {
        let close = crate::rdm::messages::CloseMsg {
          stream_id: *stream_id,
          domain: *domain,
        };
        match self.write_now(OutboundMsg::Close(close)) {
          WriteResult::Done | WriteResult::Stashed => {
            self.streams_pending_request.pop_front();
            Ok(StreamSubmitOutcome::Sent)
          }
          WriteResult::NoBuffers(_) => Ok(StreamSubmitOutcome::NeedFlush),
          WriteResult::Fatal(text) => Err(WatchlistError::TransportFatal(text)),
        }
      }
      PendingStream::Item(stream_id) => self.submit_item_stream_msg(*stream_id),
    }
  }

  fn submit_item_stream_msg(&mut self, stream_id: i32) -> Result<StreamSubmitOutcome> {
    let Some(stream) = self.streams.get(&stream_id) else {
      self.streams_pending_request.pop_front();
      return Ok(StreamSubmitOutcome::Sent);
    };

    if stream.closing {
      let close = crate::rdm::messages::CloseMsg {
        stream_id,
        domain: stream.domain,
      };
      return match self.write_now(OutboundMsg::Close(close)) {
        WriteResult::Done | WriteResult::Stashed => {
          self.streams_pending_request.pop_front();
          self.streams.remove(&stream_id);
          trace!("item stream {stream_id} closed upstream and destroyed");
          Ok(StreamSubmitOutcome::Sent)
        }
        WriteResult::NoBuffers(_) => Ok(StreamSubmitOutcome::NeedFlush),
        WriteResult::Fatal(text) => Err(WatchlistError::TransportFatal(text)),
      };
    }

    // Build the aggregate request.
    let mut request = RequestMsg::new(stream_id, stream.domain, stream.attributes.msg_key.clone());
    if stream.attributes.qos.is_specified() {
      request.qos = Some(stream.attributes.qos);
    }
    let mut send_msg = false;

    if stream.refresh_state != RefreshState::RequestRefresh {
      request.flags |= RequestFlag::NoRefresh;
    } else {
      send_msg = true;
    }

    let mut new_priority = None;
    if stream.streaming_count > 0 {
      request.flags |= RequestFlag::Streaming;

      if stream.has_flag(StreamFlag::PendingPriorityChange) {
        if let Some(merged) = self.merge_priority(stream) {
          if merged.class != stream.priority.class || merged.count != stream.priority.count {
            request.priority = Some(merged);
            new_priority = Some(merged);
            send_msg = true;
          }
        }
      }

      if self.config.support_optimized_pause_resume
        && stream.paused_count == stream.streaming_count
      {
        if !stream.has_flag(StreamFlag::Paused) {
          send_msg = true;
        }
        request.flags |= RequestFlag::Pause;
      } else if stream.has_flag(StreamFlag::Paused) {
        send_msg = true;
      }
    }

    let mut has_view_flag = false;
    let mut view_to_send = false;
    if self.config.support_view_requests {
      if stream.view_count as usize == stream.request_count() {
        has_view_flag = true;
        if stream.has_flag(StreamFlag::PendingViewChange)
          && !stream.has_flag(StreamFlag::PendingViewRefresh)
        {
          // Merge staged views; send only when the overall view changed.
          let stream_mut = self.streams.get_mut(&stream_id).expect("stream exists");
          let viewed = stream_mut.has_flag(StreamFlag::Viewed);
          if let Some(aggregate) = stream_mut.aggregate_view.as_mut() {
            let updated = aggregate.merge();
            if updated || !viewed {
              view_to_send = true;
              send_msg = true;
            }
          }
        }
      } else if stream.has_flag(StreamFlag::Viewed) {
        // A joiner without a view removes the aggregate view.
        let stream_mut = self.streams.get_mut(&stream_id).expect("stream exists");
        stream_mut.flags |= StreamFlag::PendingViewChange;
        send_msg = true;
      }
    }

    let stream = self.streams.get(&stream_id).expect("stream exists");
    if view_to_send {
      request.view = stream.aggregate_view.as_ref().map(|agg| agg.snapshot());
    }
    if stream.has_flag(StreamFlag::Private) {
      request.flags |= RequestFlag::PrivateStream;
    }
    if stream.has_flag(StreamFlag::Qualified) {
      request.flags |= RequestFlag::QualifiedStream;
    }
    if let Some(extra_id) = stream.request_with_extra_info {
      if let Some(WlRequest::Item(extra)) = self.requests.get(&extra_id) {
        request.payload = extra.payload.clone();
        request.extended_header = extra.extended_header.clone();
        send_msg = true;
      }
    }
    let no_refresh = request.flags.contains(RequestFlag::NoRefresh);
    let streaming = request.flags.contains(RequestFlag::Streaming);
    let paused = request.flags.contains(RequestFlag::Pause);

    if send_msg {
      match self.write_now(OutboundMsg::Request(request)) {
        WriteResult::Done | WriteResult::Stashed => (),
        WriteResult::NoBuffers(_) => {
          // Undo the view merge; it will be redone on the retry.
          if view_to_send {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
              if let Some(aggregate) = stream.aggregate_view.as_mut() {
                aggregate.unmerge();
              }
            }
          }
          return Ok(StreamSubmitOutcome::NeedFlush);
        }
        WriteResult::Fatal(text) => return Err(WatchlistError::TransportFatal(text)),
      }
    }

    // Sent (or nothing needed): commit stream state.
    let stream = self.streams.get_mut(&stream_id).expect("stream exists");
    if !no_refresh {
      let moving: Vec<i32> = stream.recovering.drain(..).collect();
      for id in &moving {
        stream.pending_refresh.push(*id);
      }
      stream.refresh_state = RefreshState::PendingRefresh;
      if !streaming {
        stream.flags |= StreamFlag::PendingSnapshot;
      }
      // Restart broadcast buffering from the last known point.
      if stream.flags.contains(StreamFlag::HasBcSeqNum) {
        stream.flags.remove(StreamFlag::HasBcSeqNum);
      }
      for id in moving {
        if let Some(WlRequest::Item(request)) = self.requests.get_mut(&id) {
          request.state = RequestState::PendingRefresh;
        }
      }
      self.set_stream_pending_response(StreamRef::Item(stream_id));
    }

    let stream = self.streams.get_mut(&stream_id).expect("stream exists");
    stream.flags.remove(StreamFlag::PendingPriorityChange);
    if let Some(priority) = new_priority {
      stream.priority = priority;
    }
    if paused {
      stream.flags |= StreamFlag::Paused;
    } else {
      stream.flags.remove(StreamFlag::Paused);
    }
    stream.request_with_extra_info = None;

    if self.config.support_view_requests && stream.has_flag(StreamFlag::PendingViewChange) {
      stream.flags.remove(StreamFlag::PendingViewChange);
      if !no_refresh {
        stream.flags |= StreamFlag::PendingViewRefresh;
      }
      if view_to_send {
        stream.flags |= StreamFlag::Viewed;
        if let Some(aggregate) = stream.aggregate_view.as_mut() {
          aggregate.commit();
        }
      } else if !has_view_flag {
        stream.flags.remove(StreamFlag::Viewed);
      }
      if stream.view_count == 0 {
        stream.aggregate_view = None;
      }
    }

    self.streams_pending_request.pop_front();
    Ok(StreamSubmitOutcome::Sent)
  }

  // ==================================================================
  // Fanout

  /// Delivers a provider message to every interested request on a stream
  /// and drives the stream's lifecycle. Ported close to the original's
  /// structure; the recovery tail handles every non-open state.
  pub(crate) fn fanout_item_msg_event(&mut self, stream_id: i32, event: ItemMsgEvent) -> Result<()> {
    if !self.streams.contains_key(&stream_id) {
      return Ok(());
    }
    self.current_fanout_stream = Some(stream_id);

    // Late FT-group assignment.
    if let Some(ft_group_id) = event.ft_group_id {
      let needs_join = self.streams[&stream_id].ft_group.is_none();
      if needs_join {
        let now = self.current_time;
        let ping_timeout = self.channel_info.ping_timeout;
        self.ft_groups.add_stream(ft_group_id, stream_id, now, ping_timeout);
        if let Some(stream) = self.streams.get_mut(&stream_id) {
          stream.ft_group = Some(ft_group_id);
        }
      }
    }

    match &event.msg {
      Msg::Update(_) => {
        self.deliver_to_queue(stream_id, QueueSel::Open, &event)?;
        if self.streams.get(&stream_id).map(|s| s.refresh_state)
          == Some(RefreshState::PendingRefreshComplete)
        {
          self.deliver_to_queue(stream_id, QueueSel::PendingRefresh, &event)?;
        }
        Ok(())
      }
      Msg::Refresh(_) => self.fanout_refresh(stream_id, event),
      Msg::Status(_) => self.fanout_status(stream_id, event),
      Msg::Ack(ack) => {
        if let Some(record) = self.post_table.match_ack(stream_id, ack.ack_id, ack.seq_num) {
          if let PostOwner::Item(request_id) = record.owner {
            if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
              request.open_posts.retain(|k| *k != record.key);
            }
            self.send_msg_event_to_item_request(event, request_id)?;
          }
        }
        // Unmatched acks are ignored.
        Ok(())
      }
      _ => {
        self.deliver_to_queue(stream_id, QueueSel::Open, &event)?;
        self.deliver_to_queue(stream_id, QueueSel::PendingRefresh, &event)?;
        Ok(())
      }
    }
  }

  fn fanout_refresh(&mut self, stream_id: i32, mut event: ItemMsgEvent) -> Result<()> {
    let Msg::Refresh(refresh) = &event.msg else {
      unreachable!()
    };
    let solicited = refresh.solicited;
    let complete = refresh.refresh_complete;
    let part_num = refresh.part_num;
    let mut state = refresh.state.clone();

    let refresh_state = self.streams[&stream_id].refresh_state;

    if solicited && refresh_state != RefreshState::Idle {
      if let Some(part) = part_num {
        if self.config.gap_recovery {
          let stream = self.streams.get_mut(&stream_id).expect("stream exists");
          if part == 0 {
            stream.next_part_num = 1;
            self.unset_gap_timer(stream_id, StreamFlag::HasPartGap);
          } else if part != stream.next_part_num {
            self.set_gap_timer(stream_id, StreamFlag::HasPartGap);
            // Out-of-order part; drop the message.
            return Ok(());
          } else {
            let stream = self.streams.get_mut(&stream_id).expect("stream exists");
            stream.next_part_num += 1;
            self.unset_gap_timer(stream_id, StreamFlag::HasPartGap);
          }
        }
      }

      if complete {
        self.unset_stream_pending_response(&StreamRef::Item(stream_id));
        self.process_refresh_complete(stream_id);
      } else {
        // Partial refresh: re-arm the response timer and expect the rest.
        self.set_stream_pending_response(StreamRef::Item(stream_id));
        if let Some(stream) = self.streams.get_mut(&stream_id) {
          stream.refresh_state = RefreshState::PendingRefreshComplete;
        }
      }
    }

    if !self.config.allow_suspect_data
      && state.data_state == DataState::Suspect
      && state.stream_state == StreamState::Open
    {
      event.flags |= EventFlag::SendClose;
      state.stream_state = StreamState::ClosedRecover;
      if let Msg::Refresh(refresh) = &mut event.msg {
        refresh.state.stream_state = StreamState::ClosedRecover;
      }
      return self.fanout_recovery(stream_id, event, state);
    }

    match state.stream_state {
      StreamState::Open => {
        if let Msg::Refresh(refresh) = &event.msg {
          if let Some(group_id) = refresh.group_id.clone() {
            self.item_group_add_stream(stream_id, group_id);
          }
        }

        {
          let stream = self.streams.get_mut(&stream_id).expect("stream exists");
          if complete && state.data_state == DataState::Ok {
            stream.flags |= StreamFlag::Established;
          } else if state.data_state != DataState::Ok {
            stream.flags.remove(StreamFlag::Established);
          }
        }

        if !solicited {
          self.deliver_to_queue(stream_id, QueueSel::Open, &event)?;
        } else if self.streams[&stream_id].has_flag(StreamFlag::PendingViewRefresh) {
          if complete {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
              stream.flags.remove(StreamFlag::PendingViewRefresh);
            }
          }
          // Open requests see a view-changing refresh as unsolicited.
          self.deliver_refresh_to_queue(stream_id, QueueSel::Open, &event)?;
        }

        if solicited || refresh_state == RefreshState::PendingRefreshComplete {
          let pending: Vec<i32> = self.streams[&stream_id].pending_refresh.clone();
          for request_id in pending {
            let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
              continue;
            };
            if request.is_streaming() {
              if complete {
                // Latch the static QoS and open the request.
                let stream_qos = self.streams[&stream_id].attributes.qos;
                if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
                  if request.worst_qos.is_some() && request.static_qos.is_none() {
                    request.static_qos = Some(stream_qos);
                    request.flags |= ItemRequestFlag::HasStaticQos;
                  }
                  request.state = RequestState::Open;
                }
                let stream = self.streams.get_mut(&stream_id).expect("stream exists");
                stream.pending_refresh.retain(|id| *id != request_id);
                stream.open.push(request_id);
              }
              self.send_refresh_event_to_item_request(event.clone(), request_id)?;
            } else {
              // Snapshot request: it sees a non-streaming state and closes
              // on completion.
              let mut snapshot_event = event.clone();
              if let Msg::Refresh(refresh) = &mut snapshot_event.msg {
                refresh.state.stream_state = StreamState::NonStreaming;
              }
              if complete {
                self.close_item_request(request_id);
              }
              self.send_refresh_event_to_item_request(snapshot_event, request_id)?;
              if complete {
                self.destroy_item_request(request_id);
              }
            }
          }

          if complete {
            let (has_recovering, has_streaming) = {
              let stream = self.streams.get(&stream_id).expect("stream exists");
              (!stream.recovering.is_empty(), stream.streaming_count > 0)
            };
            if has_recovering {
              // Waiters can start their own refresh cycle now.
              self.item_stream_set_msg_pending(stream_id, true);
            } else if !has_streaming {
              // Nothing left to stream; close (upstream close required,
              // since the stream state is still open).
              self.item_stream_close(stream_id);
            }
          }
        }

        Ok(())
      }

      StreamState::NonStreaming => {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
          stream.flags.remove(StreamFlag::Established);
        }
        let pending_snapshot = self.streams[&stream_id].has_flag(StreamFlag::PendingSnapshot);

        if pending_snapshot {
          if solicited || refresh_state == RefreshState::PendingRefreshComplete {
            let pending: Vec<i32> = self.streams[&stream_id].pending_refresh.clone();
            for request_id in pending {
              if complete {
                self.close_item_request(request_id);
              }
              self.send_refresh_event_to_item_request(event.clone(), request_id)?;
              if complete {
                self.destroy_item_request(request_id);
              }
            }
            if complete {
              if let Some(stream) = self.streams.get_mut(&stream_id) {
                stream.flags.remove(StreamFlag::PendingSnapshot);
              }
              let has_recovering = !self.streams[&stream_id].recovering.is_empty();
              if has_recovering {
                // Reset and reopen for the streaming requests that waited.
                self.item_stream_reset_state(stream_id);
                self.item_stream_set_msg_pending(stream_id, true);
              } else {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                  stream.flags |= StreamFlag::Closed;
                }
                self.item_stream_close(stream_id);
              }
            }
          }
          Ok(())
        } else {
          // Non-streaming refresh ends every request on the stream.
          let pending: Vec<i32> = self.streams[&stream_id].pending_refresh.clone();
          for request_id in pending {
            if complete {
              self.close_item_request(request_id);
            }
            self.send_refresh_event_to_item_request(event.clone(), request_id)?;
            if complete {
              self.destroy_item_request(request_id);
            }
          }
          let open: Vec<i32> = self.streams[&stream_id].open.clone();
          for request_id in open {
            if complete {
              self.close_item_request(request_id);
            }
            self.send_refresh_event_to_item_request(event.clone(), request_id)?;
            if complete {
              self.destroy_item_request(request_id);
            }
          }
          if complete {
            if let Some(stream) = self.streams.get_mut(&stream_id) {
              stream.flags |= StreamFlag::Closed;
            }
            self.item_stream_close(stream_id);
          }
          Ok(())
        }
      }

      _ => self.fanout_recovery(stream_id, event, state),
    }
  }

  fn fanout_status(&mut self, stream_id: i32, mut event: ItemMsgEvent) -> Result<()> {
    let Msg::Status(status) = &event.msg else {
      unreachable!()
    };
    if let Some(group_id) = status.group_id.clone() {
      self.item_group_add_stream(stream_id, group_id);
    }

    let Some(state) = status.state.clone() else {
      // Stateless status: notify everyone.
      self.deliver_to_queue(stream_id, QueueSel::Open, &event)?;
      self.deliver_to_queue(stream_id, QueueSel::PendingRefresh, &event)?;
      return Ok(());
    };

    if state.stream_state == StreamState::Open {
      if !self.config.allow_suspect_data && state.data_state == DataState::Suspect {
        event.flags |= EventFlag::SendClose;
        let mut recovery_state = state;
        recovery_state.stream_state = StreamState::ClosedRecover;
        if let Msg::Status(status) = &mut event.msg {
          if let Some(s) = status.state.as_mut() {
            s.stream_state = StreamState::ClosedRecover;
          }
        }
        return self.fanout_recovery(stream_id, event, recovery_state);
      }

      {
        let stream = self.streams.get_mut(&stream_id).expect("stream exists");
        if state.data_state == DataState::Ok {
          stream.flags |= StreamFlag::Established;
        } else {
          stream.flags.remove(StreamFlag::Established);
        }
      }
      self.deliver_to_queue(stream_id, QueueSel::Open, &event)?;
      self.deliver_to_queue(stream_id, QueueSel::PendingRefresh, &event)?;
      Ok(())
    } else {
      self.fanout_recovery(stream_id, event, state)
    }
  }

  /// The stream is going away: deliver the terminal state to every
  /// request, recover the recoverable ones, close the rest.
  fn fanout_recovery(&mut self, stream_id: i32, event: ItemMsgEvent, state: State) -> Result<()> {
    let (requests, is_private) = {
      let stream = self.streams.get_mut(&stream_id).expect("stream exists");
      let mut requests: Vec<i32> = Vec::with_capacity(stream.request_count());
      requests.append(&mut stream.pending_refresh);
      requests.append(&mut stream.open);
      requests.append(&mut stream.recovering);
      (requests, stream.has_flag(StreamFlag::Private))
    };

    if !event.flags.contains(EventFlag::SendClose) {
      // The provider closed the stream; no upstream close needed.
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.flags |= StreamFlag::Closed;
      }
    }
    for request_id in &requests {
      if let Some(WlRequest::Item(request)) = self.requests.get_mut(request_id) {
        request.stream = None;
        request.view_handle = None;
        request.state = RequestState::ServiceRecovering; // transient; fixed below
      }
    }
    self.item_stream_close(stream_id);

    for request_id in requests {
      let (service_key, recoverable) = {
        let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
          continue;
        };
        let recoverable = !is_private
          && (request.domain != DomainType::Dictionary
            || !request.flags.contains(ItemRequestFlag::Refreshed))
          && self.config.single_open
          && state.stream_state == StreamState::ClosedRecover;
        (request.service_key.clone(), recoverable)
      };

      // Posts awaiting acknowledgement die with the stream.
      self.post_table.remove_owner(PostOwner::Item(request_id));
      if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
        request.open_posts.clear();
      }

      if recoverable {
        let matched = self
          .requested_services
          .get(&service_key)
          .and_then(|r| r.matching_service)
          .is_some();
        if matched {
          if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
            request.state = RequestState::New;
          }
          self.new_requests.push_back(request_id);
        } else {
          // Service is gone; skip the redundant re-request and wait on the
          // recovering list.
          if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
            request.state = RequestState::ServiceRecovering;
          }
          self
            .requested_service_mut(&service_key)
            .recovering_list
            .push(request_id);
        }

        // Deliver with the state softened to open/suspect.
        let mut recovered_event = event.clone();
        set_msg_state(&mut recovered_event.msg, StreamState::Open, DataState::Suspect);
        if matches!(recovered_event.msg, Msg::Refresh(_)) {
          self.send_refresh_event_to_item_request(recovered_event, request_id)?;
        } else {
          self.send_msg_event_to_item_request(recovered_event, request_id)?;
        }
      } else {
        self.close_item_request(request_id);
        let delivered = event.clone();
        if matches!(delivered.msg, Msg::Refresh(_)) {
          self.send_refresh_event_to_item_request(delivered, request_id)?;
        } else {
          self.send_msg_event_to_item_request(delivered, request_id)?;
        }
        self.destroy_item_request(request_id);
      }
    }

    self.current_fanout_stream = None;
    Ok(())
  }

  fn item_stream_reset_state(&mut self, stream_id: i32) {
    if let Some(stream) = self.streams.get_mut(&stream_id) {
      stream.refresh_state = RefreshState::Idle;
      stream.flags.remove(StreamFlag::Established);
      stream.flags.remove(StreamFlag::PendingSnapshot);
      stream.flags.remove(StreamFlag::Paused);
      stream.seq_num = 0;
      stream.bc_synch_seq_num = 0;
      stream.next_part_num = 0;
      stream.flags.remove(StreamFlag::HasBcSeqNum);
      stream.flags.remove(StreamFlag::HasUcSeqNum);
      stream.flags.remove(StreamFlag::HasBcSynchSeqNum);
      stream.reorder.discard_all();
    }
  }

  fn item_group_add_stream(&mut self, stream_id: i32, group_id: Bytes) {
    let Some(stream) = self.streams.get_mut(&stream_id) else {
      return;
    };
    let previous = stream.item_group.clone();
    let service_id = stream.service_id;
    stream.item_group = Some(group_id.clone());
    if let Some(service) = self.services.get_mut(&service_id) {
      service
        .item_groups
        .add_stream(&group_id, stream_id, previous.as_ref());
    }
  }

  // ==================================================================
  // Delivery to requests

  /// Sends one message event to one item request, applying per-request
  /// fix-ups (stream id, message key echo, private-stream notify flag).
  pub(crate) fn send_msg_event_to_item_request(
    &mut self,
    mut event: ItemMsgEvent,
    request_id: i32,
  ) -> Result<()> {
    let (user_handle, service_name, is_private, wants_key, msg_key, matched_service, is_symbol_list) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      let wants_key = request.request_flags.contains(RequestFlag::MsgKeyInUpdates)
        || (request.flags.contains(ItemRequestFlag::ProvDriven)
          && !request.flags.contains(ItemRequestFlag::HasProvKey));
      let matched = self
        .requested_services
        .get(&request.service_key)
        .and_then(|r| r.matching_service);
      (
        request.user_handle,
        request.service_key.name().map(str::to_string),
        request.is_private(),
        wants_key,
        request.msg_key.clone(),
        matched,
        request.symbol_list.is_some(),
      )
    };

    event.msg.set_stream_id(request_id);

    if is_private {
      if let Msg::Status(status) = &event.msg {
        if status.state.as_ref().is_some_and(|s| {
          s.stream_state == StreamState::ClosedRecover && s.data_state == DataState::Suspect
        }) {
          event.flags |= EventFlag::NotifyStatus;
        }
      }
    }

    if wants_key {
      let mut key = msg_key;
      if key.service_id.is_none() {
        key.service_id = matched_service;
      }
      attach_msg_key(&mut event.msg, key);
      if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
        request.flags |= ItemRequestFlag::HasProvKey;
      }
    }

    let symbol_list_msg = is_symbol_list.then(|| event.msg.clone());

    let mut out = MsgEvent::item(event.msg);
    out.seq_num = event.seq_num;
    out.ft_group_id = event.ft_group_id;
    out.flags = event.flags;
    out.stream_info.user_handle = user_handle;
    out.stream_info.service_name = service_name;
    self.emit_event(out);

    if let Some(msg) = symbol_list_msg {
      self.process_symbol_list_msg(request_id, &msg)?;
    }
    Ok(())
  }

  /// Refresh delivery with the solicited-flag fix-up: an already-refreshed
  /// request must not see SOLICITED again.
  pub(crate) fn send_refresh_event_to_item_request(
    &mut self,
    mut event: ItemMsgEvent,
    request_id: i32,
  ) -> Result<()> {
    let Msg::Refresh(refresh) = &mut event.msg else {
      return self.send_msg_event_to_item_request(event, request_id);
    };
    let refreshed = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      request.flags.contains(ItemRequestFlag::Refreshed)
    };
    if refresh.solicited && refreshed {
      refresh.solicited = false;
    } else if refresh.solicited && refresh.refresh_complete {
      if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
        request.flags |= ItemRequestFlag::Refreshed;
      }
    }
    self.send_msg_event_to_item_request(event, request_id)
  }

  fn deliver_to_queue(&mut self, stream_id: i32, queue: QueueSel, event: &ItemMsgEvent) -> Result<()> {
    let ids: Vec<i32> = {
      let Some(stream) = self.streams.get(&stream_id) else {
        return Ok(());
      };
      match queue {
        QueueSel::Open => stream.open.clone(),
        QueueSel::PendingRefresh => stream.pending_refresh.clone(),
      }
    };
    for request_id in ids {
      self.send_msg_event_to_item_request(event.clone(), request_id)?;
      if self.current_fanout_stream.is_none() {
        break;
      }
    }
    Ok(())
  }

  fn deliver_refresh_to_queue(
    &mut self,
    stream_id: i32,
    queue: QueueSel,
    event: &ItemMsgEvent,
  ) -> Result<()> {
    let ids: Vec<i32> = {
      let Some(stream) = self.streams.get(&stream_id) else {
        return Ok(());
      };
      match queue {
        QueueSel::Open => stream.open.clone(),
        QueueSel::PendingRefresh => stream.pending_refresh.clone(),
      }
    };
    for request_id in ids {
      self.send_refresh_event_to_item_request(event.clone(), request_id)?;
      if self.current_fanout_stream.is_none() {
        break;
      }
    }
    Ok(())
  }

  // ==================================================================
  // Sequencing (multicast reordering)

  pub(crate) fn set_gap_timer(&mut self, stream_id: i32, flag: StreamFlag) {
    debug_assert!(gap_flags().contains(flag));
    let Some(stream) = self.streams.get_mut(&stream_id) else {
      return;
    };
    if !stream.flags.contains(flag) {
      if !stream.flags.intersects(gap_flags()) {
        self.gap_expire_time = self.current_time + self.config.gap_timeout;
        self.gap_stream_queue.push_back(stream_id);
      }
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.flags |= flag;
      }
      trace!("gap timer set on stream {stream_id} ({flag:?})");
    }
  }

  pub(crate) fn unset_gap_timer(&mut self, stream_id: i32, flag: StreamFlag) {
    debug_assert!(gap_flags().contains(flag));
    let Some(stream) = self.streams.get_mut(&stream_id) else {
      return;
    };
    if stream.flags.contains(flag) {
      stream.flags.remove(flag);
      if !stream.flags.intersects(gap_flags()) {
        self.gap_stream_queue.retain(|id| *id != stream_id);
        if self.gap_stream_queue.is_empty() {
          self.gap_expire_time = TIME_UNSET;
        }
      }
    }
  }

  /// Forwards queued messages up to and including `seq`.
  fn forward_until(&mut self, stream_id: i32, seq: u32) -> Result<()> {
    loop {
      let Some(buffered) = self
        .streams
        .get_mut(&stream_id)
        .and_then(|s| s.reorder.pop_until(seq))
      else {
        return Ok(());
      };
      let event = ItemMsgEvent {
        msg: buffered.msg,
        seq_num: Some(buffered.seq_num),
        ft_group_id: buffered.ft_group_id,
        flags: BitFlags::empty(),
      };
      self.fanout_item_msg_event(stream_id, event)?;
      if self.current_fanout_stream.is_none() {
        return Ok(());
      }
    }
  }

  /// Forwards all remaining queued messages.
  fn forward_all_queued(&mut self, stream_id: i32) -> Result<()> {
    loop {
      let Some(buffered) = self.streams.get_mut(&stream_id).and_then(|s| s.reorder.pop()) else {
        return Ok(());
      };
      let event = ItemMsgEvent {
        msg: buffered.msg,
        seq_num: Some(buffered.seq_num),
        ft_group_id: buffered.ft_group_id,
        flags: BitFlags::empty(),
      };
      self.fanout_item_msg_event(stream_id, event)?;
      if self.current_fanout_stream.is_none() {
        return Ok(());
      }
    }
  }

  /// Gap-recovery-off path: broadcast never caught up with unicast;
  /// assume loss and drain the buffer.
  pub(crate) fn drain_reorder_buffer(&mut self, stream_id: i32) -> Result<()> {
    self.current_fanout_stream = Some(stream_id);
    loop {
      let Some(buffered) = self.streams.get_mut(&stream_id).and_then(|s| s.reorder.pop()) else {
        break;
      };
      // Track the sequence so equal-numbered refreshes still pass.
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        if !stream.flags.contains(StreamFlag::HasBcSeqNum) {
          stream.flags |= StreamFlag::HasUcSeqNum;
          stream.seq_num = buffered.seq_num;
        }
      }
      let event = ItemMsgEvent {
        msg: buffered.msg,
        seq_num: Some(buffered.seq_num),
        ft_group_id: buffered.ft_group_id,
        flags: BitFlags::empty(),
      };
      self.fanout_item_msg_event(stream_id, event)?;
      if self.current_fanout_stream.is_none() {
        return Ok(());
      }
      self.current_fanout_stream = Some(stream_id);
    }
    Ok(())
  }

  fn buffer_event(&mut self, stream_id: i32, event: ItemMsgEvent) {
    let is_unicast = event.msg.stream_id() != 0;
    if let Some(stream) = self.streams.get_mut(&stream_id) {
      stream.reorder.push(BufferedMsg {
        seq_num: event.seq_num.unwrap_or(0),
        ft_group_id: event.ft_group_id,
        is_unicast,
        msg: event.msg,
      });
    }
  }

  fn close_stream_out_of_order(&mut self, stream_id: i32, text: &str) -> Result<()> {
    let (domain, ft_group) = {
      let Some(stream) = self.streams.get(&stream_id) else {
        return Ok(());
      };
      (stream.domain, stream.ft_group)
    };
    let state = State::new(StreamState::ClosedRecover, DataState::Suspect).with_text(text);
    let mut status = StatusMsg::new(stream_id, domain, state);
    status.clear_cache = true;
    let mut event = ItemMsgEvent::status_with_close(status);
    event.ft_group_id = ft_group;
    let result = self.fanout_item_msg_event(stream_id, event);
    self.current_fanout_stream = None;
    result
  }

  /// Sequencing of broadcast/unicast traffic on one item stream. Ported
  /// from the original ordering routine; see the stream flag table for the
  /// state bits involved.
  pub(crate) fn order_msg(&mut self, stream_id: i32, event: ItemMsgEvent) -> Result<()> {
    let seq_num = event.seq_num.expect("sequenced message");
    let is_unicast = event.msg.stream_id() != 0;
    let gap_recovery = self.config.gap_recovery;

    let (refresh_state, flags, stream_seq, bc_synch_seq) = {
      let stream = self.streams.get(&stream_id).expect("stream exists");
      (
        stream.refresh_state,
        stream.flags,
        stream.seq_num,
        stream.bc_synch_seq_num,
      )
    };
    let reordering = matches!(
      refresh_state,
      RefreshState::PendingRefresh | RefreshState::PendingRefreshComplete
    );

    if is_unicast {
      if !reordering {
        // Not reordering; forward immediately.
        let result = self.fanout_item_msg_event(stream_id, event);
        self.current_fanout_stream = None;
        return result;
      }

      // A broadcast message was used for synchronization; this unicast
      // message must not precede it.
      if flags.contains(StreamFlag::HasBcSynchSeqNum) {
        if seq_compare(seq_num, bc_synch_seq) < 0 {
          return self
            .close_stream_out_of_order(stream_id, "Multicast message was forwarded out of order.");
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
          stream.flags.remove(StreamFlag::HasBcSynchSeqNum);
        }
      }

      if !flags.contains(StreamFlag::HasUcSeqNum) {
        // First unicast message anchors the sequence.
        {
          let stream = self.streams.get_mut(&stream_id).expect("stream exists");
          stream.flags |= StreamFlag::HasUcSeqNum;
          stream.seq_num = seq_num;
        }
        if gap_recovery {
          let anchored = self
            .streams
            .get_mut(&stream_id)
            .and_then(|s| s.reorder.anchor_broadcast_sequence(seq_num));
          if let Some((last, has_gap)) = anchored {
            let stream = self.streams.get_mut(&stream_id).expect("stream exists");
            stream.flags |= StreamFlag::HasBcSeqNum;
            stream.seq_num = last;
            if has_gap {
              self.set_gap_timer(stream_id, StreamFlag::HasBcSeqGap);
            }
          }
        } else {
          let last = self
            .streams
            .get(&stream_id)
            .and_then(|s| s.reorder.last_broadcast_seq());
          if let Some(last) = last {
            let stream = self.streams.get_mut(&stream_id).expect("stream exists");
            stream.flags |= StreamFlag::HasBcSeqNum;
            stream.seq_num = last;
          }
        }
        self.fanout_item_msg_event(stream_id, event)?;
      } else {
        // If the broadcast stream is already known to be behind, buffer.
        let has_uc_buffered = self
          .streams
          .get(&stream_id)
          .is_some_and(|s| s.reorder.has_unicast_msgs());
        if has_uc_buffered {
          self.buffer_event(stream_id, event);
          self.current_fanout_stream = None;
          return Ok(());
        }

        self.forward_until(stream_id, seq_num)?;
        if self.current_fanout_stream.is_none() {
          return Ok(());
        }

        let current = self.streams[&stream_id].seq_num;
        if seq_compare(seq_num, current) > 0 {
          self.set_gap_timer(stream_id, StreamFlag::BcBehindUc);
          self.buffer_event(stream_id, event);
          self.current_fanout_stream = None;
          return Ok(());
        }
        self.fanout_item_msg_event(stream_id, event)?;
      }

      if self.current_fanout_stream.is_none() {
        return Ok(());
      }
      if self.streams.get(&stream_id).map(|s| s.refresh_state) == Some(RefreshState::Idle) {
        // Ordering finished with the refresh; flush the rest.
        self.forward_all_queued(stream_id)?;
      }
      self.current_fanout_stream = None;
      Ok(())
    } else {
      // Broadcast message.
      if seq_num == 0 {
        if reordering {
          // The sequence reset under our pending refresh; that refresh is
          // not coming.
          return self.close_stream_out_of_order(
            stream_id,
            "Stream sequence was reset while waiting for refresh.",
          );
        }
        {
          let stream = self.streams.get_mut(&stream_id).expect("stream exists");
          stream.flags |= StreamFlag::HasBcSeqNum;
          stream.seq_num = 0;
        }
        let result = self.fanout_item_msg_event(stream_id, event);
        self.current_fanout_stream = None;
        return result;
      }

      if matches!(event.msg, Msg::Status(_)) && reordering {
        return self.order_broadcast_synch_msg(stream_id, event);
      }

      if !flags.contains(StreamFlag::HasUcSeqNum) {
        // No unicast anchor yet; buffer until one arrives.
        self.buffer_event(stream_id, event);
        self.current_fanout_stream = None;
        return Ok(());
      }

      if !flags.contains(StreamFlag::HasBcSeqNum) {
        if seq_compare(seq_num, stream_seq) <= 0 {
          // Broadcast is still behind the unicast anchor. A deficit can
          // mean a missed sequence reset on failover, so keep a timer on
          // it; discard either way.
          if seq_compare(seq_num, stream_seq) < 0 {
            self.set_gap_timer(stream_id, StreamFlag::BcBehindUc);
          } else {
            self.unset_gap_timer(stream_id, StreamFlag::BcBehindUc);
          }
          self.current_fanout_stream = None;
          return Ok(());
        }
        let has_uc = self.streams[&stream_id].reorder.has_unicast_msgs();
        if !has_uc {
          self.unset_gap_timer(stream_id, StreamFlag::BcBehindUc);
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
          stream.flags |= StreamFlag::HasBcSeqNum;
        }
      }

      let current = self.streams[&stream_id].seq_num;
      if gap_recovery && seq_num != next_seq(current) {
        self.set_gap_timer(stream_id, StreamFlag::HasBcSeqGap);
        self.buffer_event(stream_id, event);
        self.current_fanout_stream = None;
        return Ok(());
      }
      self.unset_gap_timer(stream_id, StreamFlag::HasBcSeqGap);
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.seq_num = seq_num;
      }

      if self.streams[&stream_id].refresh_state == RefreshState::Idle {
        let result = self.fanout_item_msg_event(stream_id, event);
        self.current_fanout_stream = None;
        return result;
      }

      // Still reordering. If unicast messages are waiting, this broadcast
      // message may let them out.
      let has_uc = self.streams[&stream_id].reorder.has_unicast_msgs();
      if has_uc {
        self.forward_until(stream_id, prev_seq(seq_num))?;
        if self.current_fanout_stream.is_none() {
          return Ok(());
        }
        let still_has_uc = self.streams[&stream_id].reorder.has_unicast_msgs();
        if still_has_uc {
          self.fanout_item_msg_event(stream_id, event)?;
          if self.current_fanout_stream.is_none() {
            return Ok(());
          }
          self.forward_until(stream_id, seq_num)?;
          if self.current_fanout_stream.is_none() {
            return Ok(());
          }
        } else {
          self.buffer_event(stream_id, event);
        }
        let caught_up = !self.streams[&stream_id].reorder.has_unicast_msgs();
        if caught_up {
          self.unset_gap_timer(stream_id, StreamFlag::BcBehindUc);
        }
        self.current_fanout_stream = None;
        return Ok(());
      }

      self.buffer_event(stream_id, event);
      self.current_fanout_stream = None;
      Ok(())
    }
  }

  /// Broadcast status messages double as synchronization points while a
  /// refresh is pending.
  fn order_broadcast_synch_msg(&mut self, stream_id: i32, event: ItemMsgEvent) -> Result<()> {
    let seq_num = event.seq_num.expect("sequenced message");
    let gap_recovery = self.config.gap_recovery;
    let flags = self.streams[&stream_id].flags;
    let stream_seq = self.streams[&stream_id].seq_num;

    if !flags.contains(StreamFlag::HasUcSeqNum) {
      // No unicast anchor: drop the backlog and synchronize on this.
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.reorder.discard_all();
        stream.flags |= StreamFlag::HasBcSynchSeqNum;
        stream.bc_synch_seq_num = seq_num;
      }
      let result = self.fanout_item_msg_event(stream_id, event);
      self.current_fanout_stream = None;
      return result;
    }

    if !flags.contains(StreamFlag::HasBcSeqNum) {
      if seq_compare(seq_num, stream_seq) <= 0 {
        if seq_compare(seq_num, stream_seq) < 0 {
          self.set_gap_timer(stream_id, StreamFlag::BcBehindUc);
        } else {
          self.unset_gap_timer(stream_id, StreamFlag::BcBehindUc);
        }
        self.current_fanout_stream = None;
        return Ok(());
      }
      let has_uc = self.streams[&stream_id].reorder.has_unicast_msgs();
      if !has_uc {
        self.unset_gap_timer(stream_id, StreamFlag::BcBehindUc);
      }
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.flags |= StreamFlag::HasBcSeqNum;
      }
    }

    let current = self.streams[&stream_id].seq_num;
    if gap_recovery && seq_num != next_seq(current) {
      self.set_gap_timer(stream_id, StreamFlag::HasBcSeqGap);
      self.current_fanout_stream = None;
      return Ok(());
    }
    self.unset_gap_timer(stream_id, StreamFlag::HasBcSeqGap);
    if let Some(stream) = self.streams.get_mut(&stream_id) {
      stream.seq_num = seq_num;
      stream.flags |= StreamFlag::HasBcSynchSeqNum;
      stream.bc_synch_seq_num = seq_num;
    }

    let has_uc = self.streams[&stream_id].reorder.has_unicast_msgs();
    if !has_uc {
      self.forward_until(stream_id, seq_num)?;
      if self.current_fanout_stream.is_none() {
        return Ok(());
      }
      let result = self.fanout_item_msg_event(stream_id, event);
      self.current_fanout_stream = None;
      result
    } else {
      self.forward_until(stream_id, prev_seq(seq_num))?;
      if self.current_fanout_stream.is_none() {
        return Ok(());
      }
      self.fanout_item_msg_event(stream_id, event)?;
      if self.current_fanout_stream.is_none() {
        return Ok(());
      }
      self.forward_until(stream_id, seq_num)?;
      if self.current_fanout_stream.is_none() {
        return Ok(());
      }
      let caught_up = !self.streams[&stream_id].reorder.has_unicast_msgs();
      if caught_up {
        self.unset_gap_timer(stream_id, StreamFlag::BcBehindUc);
      }
      self.current_fanout_stream = None;
      Ok(())
    }
  }

  /// Private streams are never reordered, but with gap recovery on their
  /// sequence is still checked. Qualified streams skip the check.
  pub(crate) fn read_private_sequenced_msg(
    &mut self,
    stream_id: i32,
    event: ItemMsgEvent,
  ) -> Result<()> {
    let seq_num = event.seq_num.expect("sequenced message");
    let (flags, stream_seq) = {
      let stream = self.streams.get(&stream_id).expect("stream exists");
      (stream.flags, stream.seq_num)
    };
    if self.config.gap_recovery
      && seq_num != 0
      && !flags.contains(StreamFlag::Qualified)
      && flags.contains(StreamFlag::HasBcSeqNum)
      && seq_num != next_seq(stream_seq)
    {
      self.set_gap_timer(stream_id, StreamFlag::HasBcSeqGap);
      Ok(())
    } else {
      {
        let stream = self.streams.get_mut(&stream_id).expect("stream exists");
        stream.flags |= StreamFlag::HasBcSeqNum;
        stream.seq_num = seq_num;
      }
      self.unset_gap_timer(stream_id, StreamFlag::HasBcSeqGap);
      self.fanout_item_msg_event(stream_id, event)?;
      self.current_fanout_stream = None;
      Ok(())
    }
  }

  /// Broadcast messages carry no stream id; match the message key to an
  /// open non-private stream.
  pub(crate) fn match_broadcast_stream(&self, msg: &Msg) -> Option<i32> {
    let key = match msg {
      Msg::Refresh(m) => m.msg_key.as_ref(),
      Msg::Update(m) => m.msg_key.as_ref(),
      Msg::Status(m) => m.msg_key.as_ref(),
      Msg::Generic(m) => m.msg_key.as_ref(),
      _ => None,
    }?;
    let domain = msg.domain();
    self
      .streams_by_attrib
      .iter()
      .find(|(attributes, _)| attributes.domain == domain && attributes.msg_key == *key)
      .map(|(_, id)| *id)
  }

  // ==================================================================
  // Consumer generic / post

  fn resolve_service_name(&self, name: &str) -> Result<u16> {
    self.service_cache.id_by_name(name).ok_or_else(|| {
      WatchlistError::invalid_argument(format!(
        "Message submitted with unknown service name {name}."
      ))
    })
  }

  pub(crate) fn process_consumer_generic(
    &mut self,
    mut generic: GenericMsg,
    service_name: Option<String>,
  ) -> Result<()> {
    let request_id = generic.stream_id;
    let stream_id = match self.requests.get(&request_id) {
      Some(WlRequest::Item(request)) => request.stream,
      _ => {
        return Err(WatchlistError::invalid_argument(format!(
          "Generic message submitted for unknown stream {request_id}."
        )));
      }
    };
    if let Some(name) = &service_name {
      let Some(key) = generic.msg_key.as_mut() else {
        return Err(WatchlistError::invalid_argument(
          "Generic message submitted with service name but no message key.",
        ));
      };
      if key.service_id.is_some() {
        return Err(WatchlistError::invalid_argument(
          "Message submitted with both service name and service ID.",
        ));
      }
      key.service_id = Some(self.resolve_service_name(name)?);
    }
    let Some(stream_id) = stream_id else {
      return Err(WatchlistError::invalid_argument(
        "Generic message submitted to stream that is not established.",
      ));
    };
    let established = self
      .streams
      .get(&stream_id)
      .is_some_and(|s| s.has_flag(StreamFlag::Established));
    if !established {
      return Err(WatchlistError::invalid_argument(
        "Generic message submitted to stream that is not established.",
      ));
    }
    generic.stream_id = stream_id;
    self.write_or_queue(OutboundMsg::Generic(generic))
  }

  pub(crate) fn process_consumer_post(
    &mut self,
    mut post: PostMsg,
    service_name: Option<String>,
  ) -> Result<()> {
    if let Some(name) = &service_name {
      let Some(key) = post.msg_key.as_mut() else {
        return Err(WatchlistError::invalid_argument(
          "Post message submitted with service name but no message key.",
        ));
      };
      if key.service_id.is_some() {
        return Err(WatchlistError::invalid_argument(
          "Message submitted with both service name and service ID.",
        ));
      }
      key.service_id = Some(self.resolve_service_name(name)?);
    }

    if post.stream_id == self.login.request_stream_id().unwrap_or(i32::MIN) {
      // Off-stream post on the login stream.
      if post.domain == DomainType::Login {
        return Err(WatchlistError::invalid_argument(
          "Post message domainType is login.",
        ));
      }
      if !self.login.established {
        return Err(WatchlistError::invalid_argument(
          "Off-stream post message submitted to login stream that is not established.",
        ));
      }
      if post.ack_requested {
        let Some(post_id) = post.post_id else {
          return Err(WatchlistError::invalid_data(
            "Post message requested acknowledgement but has no post ID.",
          ));
        };
        if self.post_table.is_full() {
          return Err(WatchlistError::invalid_argument(
            "Too many outstanding posts.",
          ));
        }
        let key = PostKey {
          stream_id: LOGIN_STREAM_ID,
          post_id,
          seq_num: post.seq_num,
        };
        let record = PostRecord {
          key,
          owner: PostOwner::Login,
          domain: post.domain,
          expire_time: self.current_time + self.config.post_ack_timeout,
        };
        if !self.post_table.add(record) {
          return Err(WatchlistError::invalid_argument(
            "Post message reuses an outstanding post ID.",
          ));
        }
        self.login.open_posts.push(key);
      }
      post.stream_id = LOGIN_STREAM_ID;
      return self.write_or_queue(OutboundMsg::Post(post));
    }

    let request_id = post.stream_id;
    let stream_id = match self.requests.get(&request_id) {
      Some(WlRequest::Item(request)) => request.stream,
      _ => {
        return Err(WatchlistError::invalid_argument(format!(
          "Post message submitted for unknown stream {request_id}."
        )));
      }
    };
    let Some(stream_id) = stream_id else {
      return Err(WatchlistError::invalid_argument(
        "Post message submitted to stream that is not established.",
      ));
    };
    let established = self
      .streams
      .get(&stream_id)
      .is_some_and(|s| s.has_flag(StreamFlag::Established));
    if !established {
      return Err(WatchlistError::invalid_argument(
        "Post message submitted to stream that is not established.",
      ));
    }
    if post.ack_requested {
      let Some(post_id) = post.post_id else {
        return Err(WatchlistError::invalid_data(
          "Post message requested acknowledgement but has no post ID.",
        ));
      };
      if self.post_table.is_full() {
        return Err(WatchlistError::invalid_argument(
          "Too many outstanding posts.",
        ));
      }
      let key = PostKey {
        stream_id,
        post_id,
        seq_num: post.seq_num,
      };
      let record = PostRecord {
        key,
        owner: PostOwner::Item(request_id),
        domain: post.domain,
        expire_time: self.current_time + self.config.post_ack_timeout,
      };
      if !self.post_table.add(record) {
        return Err(WatchlistError::invalid_argument(
          "Post message reuses an outstanding post ID.",
        ));
      }
      if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
        request.open_posts.push(key);
      }
    }
    post.stream_id = stream_id;
    self.write_or_queue(OutboundMsg::Post(post))
  }
}

enum QueueSel {
  Open,
  PendingRefresh,
}

fn set_msg_state(msg: &mut Msg, stream_state: StreamState, data_state: DataState) {
  match msg {
    Msg::Refresh(m) => {
      m.state.stream_state = stream_state;
      m.state.data_state = data_state;
    }
    Msg::Status(m) => {
      if let Some(state) = m.state.as_mut() {
        state.stream_state = stream_state;
        state.data_state = data_state;
      }
    }
    _ => (),
  }
}

fn attach_msg_key(msg: &mut Msg, key: MsgKey) {
  match msg {
    Msg::Refresh(m) => {
      if m.msg_key.is_none() {
        m.msg_key = Some(key);
      }
    }
    Msg::Update(m) => {
      if m.msg_key.is_none() {
        m.msg_key = Some(key);
      }
    }
    Msg::Status(m) => {
      if m.msg_key.is_none() {
        m.msg_key = Some(key);
      }
    }
    Msg::Generic(m) => {
      if m.msg_key.is_none() {
        m.msg_key = Some(key);
      }
    }
    Msg::Ack(m) => {
      if m.msg_key.is_none() {
        m.msg_key = Some(key);
      }
    }
    _ => (),
  }
}
