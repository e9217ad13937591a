//! Login stream handling: session bring-up, recovery policy, pause-all.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::rdm::{
  login::{LoginMsg, LoginRequest, LoginStatus},
  messages::{Msg, RequestFlag},
  state::{DataState, State, StreamState},
};

use super::{
  channel::OutboundMsg,
  error::{Result, WatchlistError},
  events::{EventFlag, MsgEvent, UserHandle},
  posts::PostKey,
  PendingStream, SessionState, StreamRef, StreamSubmitOutcome, Watchlist, WlRequest, WriteResult,
  LOGIN_STREAM_ID,
};

/// The application's login request as tracked by the engine.
#[derive(Debug)]
pub struct WlLoginRequest {
  pub request: LoginRequest,
  pub user_handle: Option<UserHandle>,
}

/// Login-side engine state. At most one login stream exists per session.
#[derive(Debug)]
pub struct WlLogin {
  pub request: Option<WlLoginRequest>,
  pub stream_open: bool,
  /// Open/Ok refresh received; off-stream posts permitted.
  pub established: bool,
  pub open_posts: Vec<PostKey>,
}

impl WlLogin {
  pub fn new() -> Self {
    Self {
      request: None,
      stream_open: false,
      established: false,
      open_posts: Vec::new(),
    }
  }

  pub fn request_stream_id(&self) -> Option<i32> {
    self.request.as_ref().map(|r| r.request.stream_id)
  }
}

/// What a provider login message means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginAction {
  None,
  Recover,
  Close,
}

fn msg_class_name(msg: &Msg) -> &'static str {
  match msg {
    Msg::Request(_) => "Request",
    Msg::Refresh(_) => "Refresh",
    Msg::Update(_) => "Update",
    Msg::Status(_) => "Status",
    Msg::Close(_) => "Close",
    Msg::Generic(_) => "Generic",
    Msg::Post(_) => "Post",
    Msg::Ack(_) => "Ack",
  }
}

impl Watchlist {
  /// Accepts a login request or reissue from the application.
  pub(crate) fn submit_login_request(
    &mut self,
    request: LoginRequest,
    user_handle: Option<UserHandle>,
  ) -> Result<()> {
    if request.stream_id <= 0 {
      return Err(WatchlistError::invalid_data(
        "Cannot open request with negative stream ID.",
      ));
    }

    let reissue = match &self.login.request {
      Some(existing) => {
        if existing.request.stream_id != request.stream_id {
          return Err(WatchlistError::invalid_argument(
            "Only one login request may be open.",
          ));
        }
        true
      }
      None => {
        if self.requests.contains_key(&request.stream_id) {
          return Err(WatchlistError::invalid_argument(
            "Domain type does not match existing request.",
          ));
        }
        false
      }
    };

    if reissue && self.config.support_optimized_pause_resume {
      let was_paused = self
        .login
        .request
        .as_ref()
        .is_some_and(|r| r.request.pause_all);
      if request.pause_all && !was_paused {
        self.pause_all_items();
      } else if !request.pause_all && was_paused {
        self.resume_all_items();
      }
    }

    let app_stream_id = request.stream_id;
    self.login.request = Some(WlLoginRequest {
      request,
      user_handle,
    });
    self.requests.insert(app_stream_id, WlRequest::Login);

    if !self.login.stream_open {
      self.login.stream_open = true;
      self.login.established = false;
    }
    let active = self
      .channel
      .as_ref()
      .is_some_and(|c| c.state() == super::channel::ChannelState::Active);
    if active || reissue {
      self.set_stream_msg_pending(PendingStream::Login);
    }
    debug!("login request accepted (reissue={reissue})");
    Ok(())
  }

  /// Marks every streaming request on every non-admin stream paused.
  fn pause_all_items(&mut self) {
    let stream_ids: Vec<i32> = self.streams.keys().copied().collect();
    for stream_id in stream_ids {
      let request_ids: Vec<i32> = {
        let stream = &self.streams[&stream_id];
        stream
          .recovering
          .iter()
          .chain(stream.pending_refresh.iter())
          .chain(stream.open.iter())
          .copied()
          .collect()
      };
      let mut paused = 0;
      for request_id in request_ids {
        if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
          if request.is_streaming() {
            request.request_flags |= RequestFlag::Pause;
            paused += 1;
          }
        }
      }
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.paused_count = paused;
      }
    }
    info!("pause-all applied");
  }

  fn resume_all_items(&mut self) {
    let stream_ids: Vec<i32> = self.streams.keys().copied().collect();
    for stream_id in stream_ids {
      let request_ids: Vec<i32> = {
        let stream = &self.streams[&stream_id];
        stream
          .recovering
          .iter()
          .chain(stream.pending_refresh.iter())
          .chain(stream.open.iter())
          .copied()
          .collect()
      };
      for request_id in request_ids {
        if let Some(WlRequest::Item(request)) = self.requests.get_mut(&request_id) {
          request.request_flags.remove(RequestFlag::Pause);
        }
      }
      if let Some(stream) = self.streams.get_mut(&stream_id) {
        stream.paused_count = 0;
      }
    }
    info!("resume-all applied");
  }

  /// Sends the outbound login request for the login stream.
  pub(crate) fn submit_login_stream_msg(&mut self) -> Result<StreamSubmitOutcome> {
    let Some(login_request) = self.login.request.as_ref() else {
      self.streams_pending_request.pop_front();
      return Ok(StreamSubmitOutcome::Sent);
    };
    let mut outbound = login_request.request.clone();
    outbound.stream_id = LOGIN_STREAM_ID;
    if !self.config.support_optimized_pause_resume {
      outbound.pause_all = false;
    }
    let no_refresh = outbound.no_refresh;

    match self.write_now(OutboundMsg::Login(outbound)) {
      WriteResult::Done | WriteResult::Stashed => {
        if self.session_state < SessionState::LoginRequested {
          self.session_state = SessionState::LoginRequested;
        }
        if !no_refresh {
          self.set_stream_pending_response(StreamRef::Login);
        }
        self.streams_pending_request.pop_front();
        Ok(StreamSubmitOutcome::Sent)
      }
      WriteResult::NoBuffers(_) => Ok(StreamSubmitOutcome::NeedFlush),
      WriteResult::Fatal(text) => Err(WatchlistError::TransportFatal(text)),
    }
  }

  /// Classifies and processes a provider login message.
  pub(crate) fn process_login_provider_msg(&mut self, mut msg: LoginMsg) -> Result<()> {
    if !self.login.stream_open || self.login.request.is_none() {
      trace!("login message for no open login stream; ignored");
      return Ok(());
    }
    self.unset_stream_pending_response(&StreamRef::Login);

    let action = match &msg {
      LoginMsg::Refresh(refresh) => {
        if refresh.state.is_open() {
          if refresh.state.data_state == DataState::Ok {
            self.login.established = true;
            // A fresh refresh (also after recovery) re-establishes the
            // session; directory bring-up follows below.
            self.session_state = SessionState::LoggedIn;
          }
          LoginAction::None
        } else {
          self.classify_login_close(refresh.state.stream_state)
        }
      }
      LoginMsg::Status(status) => match &status.state {
        Some(state) if !state.is_open() => self.classify_login_close(state.stream_state),
        _ => LoginAction::None,
      },
      LoginMsg::Request(_) => {
        return Err(WatchlistError::invalid_data(
          "Received request message on login stream.",
        ));
      }
    };

    let app_stream_id = self.login.request_stream_id().expect("login request exists");
    msg.set_stream_id(app_stream_id);
    let user_handle = self.login.request.as_ref().and_then(|r| r.user_handle);

    match action {
      LoginAction::None => {
        let mut event = MsgEvent::login(msg);
        event.stream_info.user_handle = user_handle;
        self.emit_event(event);

        // A successful login opens (or reissues) the directory stream.
        if self.session_state == SessionState::LoggedIn {
          self.directory_stream_open = true;
          self.set_stream_msg_pending(PendingStream::Directory);
          self.session_state = SessionState::Ready;
        }
        Ok(())
      }
      LoginAction::Recover => {
        let mut event = MsgEvent::login(msg);
        event.stream_info.user_handle = user_handle;
        self.emit_event(event);

        // Recover the login stream: everything open goes back to recovery
        // and the login request is resent.
        self.login.established = false;
        self.session_state = SessionState::Start;
        self.recover_all_items()?;
        self.set_stream_msg_pending(PendingStream::Login);
        Ok(())
      }
      LoginAction::Close => {
        self.login.established = false;
        self.login.stream_open = false;
        let login_app_id = app_stream_id;
        self.requests.remove(&login_app_id);
        self.login.request = None;

        let mut event = MsgEvent::login(msg);
        event.stream_info.user_handle = user_handle;
        self.emit_event(event);

        self.close_all_items_for_login_close()?;
        self.directory_stream_open = false;
        self.session_state = SessionState::Start;
        Ok(())
      }
    }
  }

  fn classify_login_close(&self, stream_state: StreamState) -> LoginAction {
    if self.config.single_open && stream_state == StreamState::ClosedRecover {
      LoginAction::Recover
    } else {
      LoginAction::Close
    }
  }

  /// Login request timed out: recycle the stream, surfacing either an
  /// open-suspect (single-open) or closed-recover status.
  pub(crate) fn process_login_timeout(&mut self, state: State) -> Result<()> {
    let Some(app_stream_id) = self.login.request_stream_id() else {
      return Ok(());
    };
    let user_handle = self.login.request.as_ref().and_then(|r| r.user_handle);

    if self.config.single_open {
      let mut softened = state;
      softened.stream_state = StreamState::Open;
      let status = LoginStatus {
        stream_id: app_stream_id,
        state: Some(softened),
      };
      let mut event = MsgEvent::login(LoginMsg::Status(status));
      event.stream_info.user_handle = user_handle;
      self.emit_event(event);

      // Recycle the login stream and try again.
      self.login.established = false;
      self.session_state = SessionState::Start;
      self.set_stream_msg_pending(PendingStream::Login);
      Ok(())
    } else {
      let status = LoginStatus {
        stream_id: app_stream_id,
        state: Some(state),
      };
      self.login.established = false;
      self.login.stream_open = false;
      self.requests.remove(&app_stream_id);
      self.login.request = None;

      let mut event = MsgEvent::login(LoginMsg::Status(status));
      event.stream_info.user_handle = user_handle;
      event.flags |= EventFlag::SendClose;
      self.emit_event(event);

      self.close_all_items_for_login_close()?;
      self.directory_stream_open = false;
      self.session_state = SessionState::Start;
      Ok(())
    }
  }

  /// Login-stream traffic that is not login-domain: off-stream post
  /// acknowledgements pass through; everything else is an error.
  pub(crate) fn read_login_offstream_msg(&mut self, msg: Msg) -> Result<()> {
    match msg {
      Msg::Ack(ack) => {
        if let Some(record) = self
          .post_table
          .match_ack(LOGIN_STREAM_ID, ack.ack_id, ack.seq_num)
        {
          self.login.open_posts.retain(|k| *k != record.key);
        }
        self.deliver_offstream_ack(ack);
        Ok(())
      }
      other => Err(WatchlistError::invalid_data(format!(
        "Received unsupported off-stream message on login stream with domain type {} and message class {}.",
        other.domain() as u8,
        msg_class_name(&other)
      ))),
    }
  }

  /// Forwards an off-stream acknowledgement to the login request.
  pub(crate) fn deliver_offstream_ack(&mut self, mut ack: crate::rdm::messages::AckMsg) {
    let Some(app_stream_id) = self.login.request_stream_id() else {
      return;
    };
    ack.stream_id = app_stream_id;
    let mut event = MsgEvent::item(Msg::Ack(ack));
    event.stream_info.user_handle = self.login.request.as_ref().and_then(|r| r.user_handle);
    self.emit_event(event);
  }

  /// Recovery of everything: clearing the service cache fans
  /// ClosedRecover out to every open item stream and sends recoverable
  /// requests back to their requested services.
  pub(crate) fn recover_all_items(&mut self) -> Result<()> {
    let updates = self.service_cache.clear();
    self.apply_service_updates(updates)
  }

  /// Provider closed the login: every item stream is closed with a fixed
  /// status, then the service cache is destroyed.
  fn close_all_items_for_login_close(&mut self) -> Result<()> {
    let stream_ids: Vec<i32> = self
      .streams
      .iter()
      .filter(|(_, s)| !s.closing)
      .map(|(id, _)| *id)
      .collect();
    for stream_id in stream_ids {
      if !self.streams.contains_key(&stream_id) {
        continue;
      }
      let domain = self.streams[&stream_id].domain;
      let state = State::new(StreamState::Closed, DataState::Suspect)
        .with_text("Login stream was closed.");
      let status = crate::rdm::messages::StatusMsg::new(stream_id, domain, state);
      let event = super::items::ItemMsgEvent::msg(Msg::Status(status));
      self.fanout_item_msg_event(stream_id, event)?;
      self.current_fanout_stream = None;
    }

    let updates = self.service_cache.clear();
    self.apply_service_updates(updates)?;
    self.post_table.clear();
    self.login.open_posts.clear();
    Ok(())
  }

  /// Application closed the login stream: drop every requested service,
  /// item stream and post record, but keep the login request so it can be
  /// reissued later.
  pub(crate) fn close_login_by_consumer(&mut self) -> Result<()> {
    if !self.login.stream_open {
      return Err(WatchlistError::invalid_argument(
        "Close requested for unknown stream.",
      ));
    }

    // Items and directory requests go away silently; the application asked
    // for the teardown.
    let item_ids: Vec<i32> = self
      .requests
      .iter()
      .filter(|(_, r)| matches!(r, WlRequest::Item(_)))
      .map(|(id, _)| *id)
      .collect();
    for request_id in item_ids {
      self.close_item_request(request_id);
      self.destroy_item_request(request_id);
    }
    let directory_ids: Vec<i32> = self
      .requests
      .iter()
      .filter(|(_, r)| matches!(r, WlRequest::Directory(_)))
      .map(|(id, _)| *id)
      .collect();
    for request_id in directory_ids {
      self.requests.remove(&request_id);
    }
    self.directory_requests_all.clear();
    let stream_ids: Vec<i32> = self.streams.keys().copied().collect();
    for stream_id in stream_ids {
      self.streams.remove(&stream_id);
    }
    self.streams_by_attrib.clear();
    self
      .streams_pending_request
      .retain(|entry| matches!(entry, PendingStream::Login | PendingStream::Directory));
    self.streams_pending_response.clear();
    self.requested_services.clear();
    self.services.clear();
    let _ = self.service_cache.clear();
    self.provider_requests_by_attrib.clear();
    self.ft_groups.clear();
    self.gap_stream_queue.clear();
    self.gap_expire_time = super::config::TIME_UNSET;
    self.post_table.clear();
    self.login.open_posts.clear();

    // Send the close upstream; the request object survives for reissue.
    self.unset_stream_msg_pending(&PendingStream::Login);
    self.set_stream_msg_pending(PendingStream::TempClose {
      stream_id: LOGIN_STREAM_ID,
      domain: crate::rdm::types::DomainType::Login,
    });
    self.login.stream_open = false;
    self.login.established = false;
    self.directory_stream_open = false;
    self.unset_stream_msg_pending(&PendingStream::Directory);
    self.session_state = SessionState::Start;
    info!("login stream closed by application");
    Ok(())
  }
}
