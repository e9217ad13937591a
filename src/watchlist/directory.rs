//! Directory stream handling and service-change fanout.
//!
//! The service cache is the source of truth; the single upstream directory
//! stream keeps it fresh. Directory requests are served out of the cache
//! and receive updates as the cache changes.

use enumflags2::BitFlags;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::rdm::{
  directory::{
    DirectoryMsg, DirectoryRefresh, DirectoryRequest, DirectoryUpdate, Service, ServiceFilterFlag,
    ServiceSpec,
  },
  messages::{Msg, StatusMsg},
  state::{State, StreamState},
  types::MapEntryAction,
};

use super::{
  channel::OutboundMsg,
  error::{Result, WatchlistError},
  events::{MsgEvent, UserHandle},
  items::ItemMsgEvent,
  service_cache::ServiceUpdate,
  PendingStream, ServiceKey, SessionState, StreamRef, StreamSubmitOutcome, Watchlist, WlRequest,
  WriteResult, DIRECTORY_STREAM_ID,
};

/// Lifecycle of one directory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryRequestState {
  PendingRefresh,
  Ok,
}

/// One application directory request.
#[derive(Debug)]
pub struct WlDirectoryRequest {
  pub stream_id: i32,
  pub user_handle: Option<UserHandle>,
  pub filter: BitFlags<ServiceFilterFlag>,
  pub service: ServiceSpec,
  pub streaming: bool,
  pub state: DirectoryRequestState,
}

impl WlDirectoryRequest {
  fn service_key(&self) -> Option<ServiceKey> {
    match &self.service {
      ServiceSpec::All => None,
      ServiceSpec::ById(id) => Some(ServiceKey::Id(*id)),
      ServiceSpec::ByName(name) => Some(ServiceKey::Name(name.clone())),
    }
  }
}

impl Watchlist {
  // ------------------------------------------------------------------
  // Submission

  pub(crate) fn submit_directory_request(
    &mut self,
    request: DirectoryRequest,
    user_handle: Option<UserHandle>,
  ) -> Result<()> {
    if request.stream_id <= 0 {
      return Err(WatchlistError::invalid_data(
        "Cannot open request with negative stream ID.",
      ));
    }

    match self.requests.get_mut(&request.stream_id) {
      Some(WlRequest::Directory(existing)) => {
        // Reissue: the service criteria are immutable.
        match (&existing.service, &request.service) {
          (ServiceSpec::ById(a), ServiceSpec::ById(b)) if a == b => (),
          (ServiceSpec::ByName(a), ServiceSpec::ByName(b)) if a == b => (),
          (ServiceSpec::All, ServiceSpec::All) => (),
          (ServiceSpec::ById(_), _) | (_, ServiceSpec::ById(_)) => {
            return Err(WatchlistError::invalid_argument(
              "Service ID does not match existing request.",
            ));
          }
          _ => {
            return Err(WatchlistError::invalid_argument(
              "Service name does not match existing request.",
            ));
          }
        }
        existing.filter = request.filter;
        existing.streaming = request.streaming;
        existing.state = DirectoryRequestState::PendingRefresh;
        let id = request.stream_id;
        if !self.new_requests.contains(&id) {
          self.new_requests.push_back(id);
        }
        Ok(())
      }
      Some(_) => Err(WatchlistError::invalid_argument(
        "Domain type does not match existing request.",
      )),
      None => {
        let directory_request = WlDirectoryRequest {
          stream_id: request.stream_id,
          user_handle,
          filter: request.filter,
          service: request.service,
          streaming: request.streaming,
          state: DirectoryRequestState::PendingRefresh,
        };
        let key = directory_request.service_key();
        let id = request.stream_id;
        if let Some(key) = key {
          self.requested_service_mut(&key).directory_requests.push(id);
        }
        self
          .requests
          .insert(id, WlRequest::Directory(directory_request));
        self.new_requests.push_back(id);
        Ok(())
      }
    }
  }

  /// Serves a newly submitted directory request from the cache; updates
  /// follow from the directory stream either way.
  pub(crate) fn activate_directory_request(&mut self, request_id: i32) -> Result<()> {
    let (spec, key) = {
      let Some(WlRequest::Directory(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      (request.service.clone(), request.service_key())
    };

    match &key {
      Some(key) => {
        let requested = self.requested_service_mut(key);
        requested.directory_requests.retain(|id| *id != request_id);
        if !requested.open_directory_requests.contains(&request_id) {
          requested.open_directory_requests.push(request_id);
        }
      }
      None => {
        if !self.directory_requests_all.contains(&request_id) {
          self.directory_requests_all.push(request_id);
        }
      }
    }

    let services = match &spec {
      ServiceSpec::All => self.service_cache.snapshot_all(),
      ServiceSpec::ById(id) => self.service_cache.snapshot_by_id(*id),
      ServiceSpec::ByName(name) => self.service_cache.snapshot_by_name(name),
    };
    if !services.is_empty() {
      self.send_service_list_to_request(request_id, services)?;
    }
    Ok(())
  }

  pub(crate) fn close_directory_request(&mut self, request_id: i32) {
    let key = match self.requests.remove(&request_id) {
      Some(WlRequest::Directory(request)) => request.service_key(),
      Some(other) => {
        self.requests.insert(request_id, other);
        return;
      }
      None => return,
    };
    match key {
      Some(key) => {
        if let Some(requested) = self.requested_services.get_mut(&key) {
          requested.directory_requests.retain(|id| *id != request_id);
          requested
            .open_directory_requests
            .retain(|id| *id != request_id);
        }
        self.check_requested_service_ref_count(&key);
      }
      None => self.directory_requests_all.retain(|id| *id != request_id),
    }
  }

  // ------------------------------------------------------------------
  // Outbound

  pub(crate) fn submit_directory_stream_msg(&mut self) -> Result<StreamSubmitOutcome> {
    if !self.directory_stream_open {
      self.streams_pending_request.pop_front();
      return Ok(StreamSubmitOutcome::Sent);
    }
    let request = DirectoryRequest::all_services(DIRECTORY_STREAM_ID);
    match self.write_now(OutboundMsg::Directory(request)) {
      WriteResult::Done | WriteResult::Stashed => {
        self.set_stream_pending_response(StreamRef::Directory);
        self.streams_pending_request.pop_front();
        Ok(StreamSubmitOutcome::Sent)
      }
      WriteResult::NoBuffers(_) => Ok(StreamSubmitOutcome::NeedFlush),
      WriteResult::Fatal(text) => Err(WatchlistError::TransportFatal(text)),
    }
  }

  // ------------------------------------------------------------------
  // Provider messages

  pub(crate) fn process_directory_provider_msg(&mut self, msg: DirectoryMsg) -> Result<()> {
    self.unset_stream_pending_response(&StreamRef::Directory);

    let (updates, stream_state) = match msg {
      DirectoryMsg::Refresh(refresh) => (
        self.service_cache.apply_refresh(&refresh.services),
        Some(refresh.state.stream_state),
      ),
      DirectoryMsg::Update(update) => (self.service_cache.apply_update(&update.services), None),
      DirectoryMsg::Status(status) => {
        (Vec::new(), status.state.map(|s| s.stream_state))
      }
      DirectoryMsg::Request(_) => {
        return Err(WatchlistError::invalid_data(
          "Received request message on directory stream.",
        ));
      }
    };

    if let Some(state) = stream_state {
      if state != StreamState::Open {
        // The directory stream cycled; reissue it without disturbing the
        // item streams.
        if self.session_state > SessionState::LoggedIn {
          self.session_state = SessionState::LoggedIn;
        }
        if self.directory_stream_open {
          self.set_stream_msg_pending(PendingStream::Directory);
          self.session_state = SessionState::Ready;
        }
        debug!("directory stream cycled; reissuing");
      }
    }

    self.apply_service_updates(updates)
  }

  /// Directory request timed out: close and recreate the stream.
  pub(crate) fn process_directory_timeout(&mut self) -> Result<()> {
    if !self.directory_stream_open {
      return Ok(());
    }
    if self.session_state > SessionState::LoggedIn {
      self.session_state = SessionState::LoggedIn;
    }
    self.set_stream_msg_pending(PendingStream::Directory);
    self.session_state = SessionState::Ready;
    warn!("directory request timed out; reissuing");
    Ok(())
  }

  // ------------------------------------------------------------------
  // Service-change processing

  /// Applies a batch of cache changes: first the effects on item streams
  /// (statuses, group changes, renames, recovery, deletions), then the
  /// fanout to directory requests.
  pub(crate) fn apply_service_updates(&mut self, updates: Vec<ServiceUpdate>) -> Result<()> {
    for update in &updates {
      match update.action {
        MapEntryAction::Delete => {
          self.detach_requested_services(update.service_id);
          self.process_removed_service(update.service_id)?;
        }
        MapEntryAction::Add | MapEntryAction::Update => {
          if update.action == MapEntryAction::Add {
            self
              .services
              .entry(update.service_id)
              .or_insert_with(|| super::WlService::new(update.service_id));
          }

          // Service-state status fans out to every open stream.
          if let Some(status) = update.service.state.as_ref().and_then(|s| s.status.clone()) {
            let stream_ids: Vec<i32> = self
              .services
              .get(&update.service_id)
              .map(|s| s.open_streams.clone())
              .unwrap_or_default();
            for stream_id in stream_ids {
              if !self.streams.contains_key(&stream_id) {
                continue;
              }
              let domain = self.streams[&stream_id].domain;
              let status_msg = StatusMsg::new(stream_id, domain, status.clone());
              self.fanout_item_msg_event(stream_id, ItemMsgEvent::msg(Msg::Status(status_msg)))?;
              self.current_fanout_stream = None;
            }
          }

          // A service going down loses its items; they recover when it
          // comes back (or another service takes the name).
          if update
            .service
            .state
            .as_ref()
            .is_some_and(|s| s.service_state == 0)
          {
            self.process_removed_service(update.service_id)?;
          }

          self.process_group_states(update)?;

          // A renamed service no longer matches requests using the old name.
          if let Some(old_name) = &update.old_name {
            let key = ServiceKey::Name(old_name.clone());
            if let Some(requested) = self.requested_services.get_mut(&key) {
              requested.matching_service = None;
            }
            if let Some(service) = self.services.get_mut(&update.service_id) {
              service.requested_services.retain(|k| *k != key);
            }
          }

          // Try to match and recover requests waiting on this service.
          let mut keys: Vec<ServiceKey> = vec![ServiceKey::Id(update.service_id)];
          if let Some(cached) = self.service_cache.get(update.service_id) {
            if !cached.name().is_empty() {
              keys.push(ServiceKey::Name(cached.name().to_string()));
            }
          }
          for key in keys {
            if !self.requested_services.contains_key(&key) {
              continue;
            }
            let unmatched = self.requested_services[&key].matching_service.is_none();
            if unmatched {
              if let Some(requested) = self.requested_services.get_mut(&key) {
                requested.matching_service = Some(update.service_id);
              }
              if let Some(service) = self.services.get_mut(&update.service_id) {
                if !service.requested_services.contains(&key) {
                  service.requested_services.push(key.clone());
                }
              }
            }
            let recovering: Vec<i32> = self.requested_services[&key].recovering_list.clone();
            for request_id in recovering {
              self.find_stream_for_request(request_id, true)?;
            }
          }
        }
      }
    }

    self.fanout_directory_updates(&updates)?;

    // Deleted services go away only after the fanout.
    for update in &updates {
      if update.action == MapEntryAction::Delete {
        self.services.remove(&update.service_id);
      }
    }
    Ok(())
  }

  /// Group filter handling: merges rename groups, statuses fan out to the
  /// member streams.
  fn process_group_states(&mut self, update: &ServiceUpdate) -> Result<()> {
    for group_state in update.service.group_states.clone() {
      let known = self
        .services
        .get(&update.service_id)
        .is_some_and(|s| s.item_groups.contains(&group_state.group));
      if !known {
        continue; // no open items in this group
      }

      let mut group_id = group_state.group.clone();
      if let Some(merged_to) = &group_state.merged_to_group {
        let moved = self
          .services
          .get_mut(&update.service_id)
          .map(|s| s.item_groups.merge(&group_id, merged_to))
          .unwrap_or_default();
        for stream_id in moved {
          if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.item_group = Some(merged_to.clone());
          }
        }
        group_id = merged_to.clone();
      }

      if let Some(status) = &group_state.status {
        let members: Vec<i32> = self
          .services
          .get(&update.service_id)
          .map(|s| s.item_groups.streams(&group_id).to_vec())
          .unwrap_or_default();
        for stream_id in members {
          if !self.streams.contains_key(&stream_id) {
            continue;
          }
          let domain = self.streams[&stream_id].domain;
          let ft_group = self.streams[&stream_id].ft_group;
          let status_msg = StatusMsg::new(stream_id, domain, status.clone());
          let mut event = ItemMsgEvent::msg(Msg::Status(status_msg));
          event.ft_group_id = ft_group;
          self.fanout_item_msg_event(stream_id, event)?;
          self.current_fanout_stream = None;
        }
        if let Some(service) = self.services.get_mut(&update.service_id) {
          service.item_groups.remove_empty(&group_id);
        }
      }
    }
    Ok(())
  }

  fn detach_requested_services(&mut self, service_id: u16) {
    let keys: Vec<ServiceKey> = self
      .services
      .get(&service_id)
      .map(|s| s.requested_services.clone())
      .unwrap_or_default();
    for key in keys {
      if let Some(requested) = self.requested_services.get_mut(&key) {
        requested.matching_service = None;
      }
    }
    if let Some(service) = self.services.get_mut(&service_id) {
      service.requested_services.clear();
    }
  }

  /// A removed service means ClosedRecover for every item on it.
  fn process_removed_service(&mut self, service_id: u16) -> Result<()> {
    let stream_ids: Vec<i32> = self
      .services
      .get(&service_id)
      .map(|s| s.open_streams.clone())
      .unwrap_or_default();
    for stream_id in stream_ids {
      if !self.streams.contains_key(&stream_id) {
        continue;
      }
      let domain = self.streams[&stream_id].domain;
      let state = State::closed_recover_suspect().with_text("Service for this item was lost.");
      let status = StatusMsg::new(stream_id, domain, state);
      self.fanout_item_msg_event(stream_id, ItemMsgEvent::msg(Msg::Status(status)))?;
      self.current_fanout_stream = None;
    }
    Ok(())
  }

  // ------------------------------------------------------------------
  // Fanout to directory requests

  fn fanout_directory_updates(&mut self, updates: &[ServiceUpdate]) -> Result<()> {
    if updates.is_empty() {
      return Ok(());
    }

    // Full updates to all-services requests.
    let all_services: Vec<Service> = updates.iter().map(|u| u.service.clone()).collect();
    for request_id in self.directory_requests_all.clone() {
      self.send_service_list_to_request(request_id, all_services.clone())?;
    }

    // Scoped requests get their own service's entry.
    for update in updates {
      let keys: Vec<ServiceKey> = self
        .services
        .get(&update.service_id)
        .map(|s| s.requested_services.clone())
        .unwrap_or_default();
      for key in keys {
        let request_ids: Vec<i32> = self
          .requested_services
          .get(&key)
          .map(|r| r.open_directory_requests.clone())
          .unwrap_or_default();
        for request_id in request_ids {
          self.send_service_list_to_request(request_id, vec![update.service.clone()])?;
        }
        self.check_requested_service_ref_count(&key);
      }
    }
    Ok(())
  }

  /// Synthesizes a refresh (first delivery) or update (after) carrying the
  /// given services to one directory request, honoring its filter.
  pub(crate) fn send_service_list_to_request(
    &mut self,
    request_id: i32,
    services: Vec<Service>,
  ) -> Result<()> {
    let (state, filter, spec, streaming, user_handle) = {
      let Some(WlRequest::Directory(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      (
        request.state,
        request.filter,
        request.service.clone(),
        request.streaming,
        request.user_handle,
      )
    };

    let filtered: Vec<Service> = services.iter().map(|s| s.apply_filter(filter)).collect();
    let service_id = match &spec {
      ServiceSpec::ById(id) => Some(*id),
      _ => None,
    };

    let msg = match state {
      DirectoryRequestState::PendingRefresh => {
        let mut refresh_state = State::open_ok();
        if !streaming {
          refresh_state.stream_state = StreamState::NonStreaming;
        }
        DirectoryMsg::Refresh(DirectoryRefresh {
          stream_id: request_id,
          state: refresh_state,
          solicited: true,
          filter,
          service_id,
          services: filtered,
        })
      }
      DirectoryRequestState::Ok => DirectoryMsg::Update(DirectoryUpdate {
        stream_id: request_id,
        filter,
        service_id,
        services: filtered,
      }),
    };

    if state == DirectoryRequestState::PendingRefresh {
      if let Some(WlRequest::Directory(request)) = self.requests.get_mut(&request_id) {
        request.state = DirectoryRequestState::Ok;
      }
    }

    let mut event = MsgEvent::directory(msg);
    event.stream_info.user_handle = user_handle;
    if let ServiceSpec::ByName(name) = &spec {
      event.stream_info.service_name = Some(name.clone());
    }
    self.emit_event(event);

    if !streaming {
      self.close_directory_request(request_id);
    }
    Ok(())
  }
}
