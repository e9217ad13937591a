//! End-to-end scenarios driving the engine through a scripted channel.

use std::{cell::RefCell, rc::Rc};

use test_log::test;

use crate::rdm::{
  directory::{
    DirectoryMsg, DirectoryRefresh, DirectoryRequest, Service, ServiceFilterFlag, ServiceInfo,
    ServiceLoad, ServiceSpec, ServiceState as RdmServiceState,
  },
  login::{LoginMsg, LoginRefresh, LoginRequest, LoginStatus},
  messages::{
    Msg, Payload, PostMsg, Priority, RefreshMsg, RequestFlag, RequestMsg, StatusMsg,
    SymbolListEntry, UpdateMsg, ViewDefinition,
  },
  msg_key::MsgKey,
  qos::Qos,
  state::{DataState, State, StatusCode, StreamState},
  types::{DomainType, MapEntryAction, NakCode, SymbolListFlags},
};

use super::{
  channel::{Channel, ChannelInfo, ChannelState, OutboundMsg, WriteOutcome},
  config::WatchlistConfig,
  events::{EventMsg, MsgEvent},
  InboundMsg, ReadOptions, SubmitMsg, SubmitOptions, Watchlist, WlRequest,
};

type WriteLog = Rc<RefCell<Vec<OutboundMsg>>>;

struct MockChannel {
  log: WriteLog,
  info: ChannelInfo,
}

impl Channel for MockChannel {
  fn state(&self) -> ChannelState {
    ChannelState::Active
  }

  fn info(&self) -> ChannelInfo {
    self.info.clone()
  }

  fn write(&mut self, msg: OutboundMsg) -> WriteOutcome {
    self.log.borrow_mut().push(msg);
    WriteOutcome::Written
  }
}

fn mock_channel() -> (Box<MockChannel>, WriteLog) {
  let log: WriteLog = Rc::new(RefCell::new(Vec::new()));
  let channel = Box::new(MockChannel {
    log: Rc::clone(&log),
    info: ChannelInfo {
      max_fragment_size: 6144,
      multicast: true,
      ping_timeout: 60_000,
    },
  });
  (channel, log)
}

fn direct_feed(service_id: u16) -> Service {
  let mut service = Service::new(service_id, MapEntryAction::Add);
  service.info = Some(ServiceInfo {
    service_name: "DIRECT_FEED".to_string(),
    capabilities: vec![6, 7, 8, 10],
    qos_list: vec![Qos::realtime_tick_by_tick()],
    ..ServiceInfo::default()
  });
  service.state = Some(RdmServiceState::default());
  service
}

fn drain_events(watchlist: &mut Watchlist) -> Vec<MsgEvent> {
  let mut events = Vec::new();
  while let Some(event) = watchlist.poll_event() {
    events.push(event);
  }
  events
}

fn login_refresh_open_ok() -> LoginMsg {
  LoginMsg::Refresh(LoginRefresh {
    stream_id: super::LOGIN_STREAM_ID,
    state: State::open_ok(),
    user_name: Some("alice".to_string()),
    solicited: true,
    supports_optimized_pause_resume: true,
    supports_post: true,
  })
}

/// Brings a watchlist to Ready state with DIRECT_FEED (id 1) in the cache.
fn ready_watchlist(config: WatchlistConfig) -> (Watchlist, WriteLog) {
  ready_watchlist_with_service(config, direct_feed(1))
}

fn ready_watchlist_with_service(config: WatchlistConfig, service: Service) -> (Watchlist, WriteLog) {
  let mut watchlist = Watchlist::new(config);
  watchlist
    .submit_msg(
      SubmitOptions {
        msg: SubmitMsg::Login(LoginMsg::Request(LoginRequest::new(1, "alice"))),
        service_name: None,
        user_handle: Some(100),
      },
      0,
    )
    .unwrap();
  let (channel, log) = mock_channel();
  watchlist.bind_channel(Some(channel)).unwrap();
  watchlist.dispatch(0).unwrap();
  assert!(matches!(log.borrow()[0], OutboundMsg::Login(_)));

  watchlist
    .read_msg(ReadOptions::msg(InboundMsg::Login(login_refresh_open_ok())), 0)
    .unwrap();
  watchlist.dispatch(0).unwrap();
  assert!(matches!(log.borrow()[1], OutboundMsg::Directory(_)));

  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Directory(DirectoryMsg::Refresh(DirectoryRefresh {
        stream_id: super::DIRECTORY_STREAM_ID,
        state: State::open_ok(),
        solicited: true,
        filter: crate::rdm::all_service_filters(),
        service_id: None,
        services: vec![service],
      }))),
      0,
    )
    .unwrap();
  drain_events(&mut watchlist);
  log.borrow_mut().clear();
  (watchlist, log)
}

fn market_price_request(stream_id: i32, name: &str) -> RequestMsg {
  let mut request = RequestMsg::new(stream_id, DomainType::MarketPrice, MsgKey::with_name(name));
  request.flags |= RequestFlag::Streaming;
  request
}

fn submit_item(watchlist: &mut Watchlist, request: RequestMsg, now: i64) {
  watchlist
    .submit_msg(
      SubmitOptions {
        msg: SubmitMsg::Item(Msg::Request(request)),
        service_name: Some("DIRECT_FEED".to_string()),
        user_handle: None,
      },
      now,
    )
    .unwrap();
}

fn upstream_id(watchlist: &Watchlist, request_id: i32) -> i32 {
  match watchlist.requests.get(&request_id) {
    Some(WlRequest::Item(request)) => request.stream.expect("request attached to a stream"),
    _ => panic!("no item request {request_id}"),
  }
}

fn solicited_complete_refresh(stream_id: i32) -> RefreshMsg {
  let mut refresh = RefreshMsg::new(stream_id, DomainType::MarketPrice, State::open_ok());
  refresh.solicited = true;
  refresh.refresh_complete = true;
  refresh
}

fn item_status_states(events: &[MsgEvent]) -> Vec<(i32, State)> {
  events
    .iter()
    .filter_map(|e| match &e.msg {
      EventMsg::Item(Msg::Status(status)) => {
        status.state.clone().map(|s| (status.stream_id, s))
      }
      _ => None,
    })
    .collect()
}

// ----------------------------------------------------------------------
// Bring-up and aggregation

#[test]
fn login_then_directory_bringup() {
  let (watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  assert_eq!(watchlist.session_state(), super::SessionState::Ready);
  assert_eq!(watchlist.service_cache.id_by_name("DIRECT_FEED"), Some(1));
}

#[test]
fn two_requests_aggregate_onto_one_stream() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  submit_item(&mut watchlist, market_price_request(6, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();

  // One upstream request for both, priority counts summed.
  let requests: Vec<RequestMsg> = log
    .borrow()
    .iter()
    .filter_map(|m| match m {
      OutboundMsg::Request(r) => Some(r.clone()),
      _ => None,
    })
    .collect();
  assert_eq!(requests.len(), 1);
  let sent = &requests[0];
  assert!(sent.flags.contains(RequestFlag::Streaming));
  assert_eq!(sent.priority, Some(Priority { class: 1, count: 2 }));
  assert_eq!(sent.msg_key.service_id, Some(1));

  assert_eq!(upstream_id(&watchlist, 5), upstream_id(&watchlist, 6));
}

#[test]
fn refresh_complete_opens_requests_and_updates_flow_in_order() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);

  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid)))),
      0,
    )
    .unwrap();
  let events = drain_events(&mut watchlist);
  assert!(matches!(
    &events[0].msg,
    EventMsg::Item(Msg::Refresh(r)) if r.stream_id == 5 && r.refresh_complete
  ));

  // Updates are delivered in receive order with the request's stream id.
  for _ in 0..3 {
    watchlist
      .read_msg(
        ReadOptions::msg(InboundMsg::Item(Msg::Update(UpdateMsg {
          stream_id: sid,
          domain: DomainType::MarketPrice,
          msg_key: None,
          payload: Payload::None,
        }))),
        0,
      )
      .unwrap();
  }
  let updates = drain_events(&mut watchlist);
  assert_eq!(updates.len(), 3);
  assert!(updates
    .iter()
    .all(|e| matches!(&e.msg, EventMsg::Item(Msg::Update(u)) if u.stream_id == 5)));
}

#[test]
fn snapshot_stream_closes_after_refresh_complete() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  let mut request = market_price_request(5, "IBM.N");
  request.flags.remove(RequestFlag::Streaming); // snapshot
  submit_item(&mut watchlist, request, 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);
  log.borrow_mut().clear();

  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid)))),
      0,
    )
    .unwrap();
  let events = drain_events(&mut watchlist);
  // Snapshot sees a non-streaming state.
  assert!(matches!(
    &events[0].msg,
    EventMsg::Item(Msg::Refresh(r))
      if r.stream_id == 5 && r.state.stream_state == StreamState::NonStreaming
  ));
  assert!(!watchlist.requests.contains_key(&5));
  assert!(!watchlist.streams.contains_key(&sid));
}

#[test]
fn dispatch_is_idempotent_without_new_work() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let written = log.borrow().len();
  watchlist.dispatch(1).unwrap();
  watchlist.dispatch(2).unwrap();
  assert_eq!(log.borrow().len(), written);
}

// ----------------------------------------------------------------------
// S1: login recovery under single-open

#[test]
fn s1_login_recovery_single_open() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  drain_events(&mut watchlist);
  log.borrow_mut().clear();

  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Login(LoginMsg::Status(LoginStatus {
        stream_id: super::LOGIN_STREAM_ID,
        state: Some(State::closed_recover_suspect()),
      }))),
      1,
    )
    .unwrap();
  let events = drain_events(&mut watchlist);

  // The login status reaches the application unchanged.
  assert!(matches!(
    &events[0].msg,
    EventMsg::Login(LoginMsg::Status(s))
      if s.state.as_ref().unwrap().stream_state == StreamState::ClosedRecover
  ));
  // The service cache was cleared and the item went back to recovery.
  assert!(watchlist.service_cache.is_empty());
  let statuses = item_status_states(&events);
  assert_eq!(statuses.len(), 1);
  assert_eq!(statuses[0].0, 5);
  assert_eq!(statuses[0].1.stream_state, StreamState::Open);
  assert_eq!(statuses[0].1.data_state, DataState::Suspect);
  let recovering = &watchlist.requested_services[&super::ServiceKey::Name("DIRECT_FEED".into())]
    .recovering_list;
  assert_eq!(recovering, &vec![5]);

  // The login stream is resent on the next dispatch.
  watchlist.dispatch(2).unwrap();
  assert!(log
    .borrow()
    .iter()
    .any(|m| matches!(m, OutboundMsg::Login(_))));
}

// ----------------------------------------------------------------------
// S2: service-down recovery

#[test]
fn s2_service_down_recovers_items() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  submit_item(&mut watchlist, market_price_request(6, "GOOG.O"), 0);
  watchlist.dispatch(0).unwrap();
  drain_events(&mut watchlist);

  let mut down = Service::new(1, MapEntryAction::Update);
  down.state = Some(RdmServiceState {
    service_state: 0,
    accepting_requests: true,
    status: None,
  });
  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Directory(DirectoryMsg::Update(
        crate::rdm::directory::DirectoryUpdate {
          stream_id: super::DIRECTORY_STREAM_ID,
          filter: crate::rdm::all_service_filters(),
          service_id: None,
          services: vec![down],
        },
      ))),
      1,
    )
    .unwrap();
  let events = drain_events(&mut watchlist);

  let statuses = item_status_states(&events);
  assert_eq!(statuses.len(), 2);
  for (_, state) in &statuses {
    assert_eq!(state.text, "Service for this item was lost.");
    // Single-open: surfaced as open/suspect, recovered internally.
    assert_eq!(state.stream_state, StreamState::Open);
    assert_eq!(state.data_state, DataState::Suspect);
  }

  let requested = &watchlist.requested_services[&super::ServiceKey::Name("DIRECT_FEED".into())];
  let mut recovering = requested.recovering_list.clone();
  let mut queued: Vec<i32> = watchlist.new_requests.iter().copied().collect();
  recovering.append(&mut queued);
  recovering.sort_unstable();
  assert_eq!(recovering, vec![5, 6]);
}

// ----------------------------------------------------------------------
// S3: batch expansion

#[test]
fn s3_batch_request_expands_and_acknowledges() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  let mut batch = RequestMsg::new(5, DomainType::MarketPrice, MsgKey::default());
  batch.flags |= RequestFlag::Streaming;
  batch.batch_items = Some(vec!["A".to_string(), "B".to_string(), "C".to_string()]);
  submit_item(&mut watchlist, batch, 0);
  watchlist.dispatch(0).unwrap();

  let events = drain_events(&mut watchlist);
  let ack = events
    .iter()
    .find_map(|e| match &e.msg {
      EventMsg::Item(Msg::Status(status)) if status.stream_id == 5 => status.state.clone(),
      _ => None,
    })
    .expect("batch acknowledgement");
  assert_eq!(ack.stream_state, StreamState::Closed);
  assert_eq!(ack.data_state, DataState::Ok);
  assert_eq!(ack.text, "Batch request acknowledged.");

  assert!(!watchlist.requests.contains_key(&5));
  for id in [6, 7, 8] {
    assert!(watchlist.requests.contains_key(&id), "sibling {id} missing");
  }
  let sent_names: Vec<String> = log
    .borrow()
    .iter()
    .filter_map(|m| match m {
      OutboundMsg::Request(r) => r.msg_key.name.clone(),
      _ => None,
    })
    .collect();
  assert_eq!(sent_names, vec!["A", "B", "C"]);
}

#[test]
fn batch_with_name_in_key_is_rejected() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  let mut batch = market_price_request(5, "BAD");
  batch.batch_items = Some(vec!["A".to_string()]);
  let result = watchlist.submit_msg(
    SubmitOptions {
      msg: SubmitMsg::Item(Msg::Request(batch)),
      service_name: Some("DIRECT_FEED".to_string()),
      user_handle: None,
    },
    0,
  );
  assert!(result.is_err());
}

// ----------------------------------------------------------------------
// S4: view aggregation

#[test]
fn s4_views_merge_and_shrink_after_close() {
  let config = WatchlistConfig {
    support_view_requests: true,
    ..WatchlistConfig::default()
  };
  let (mut watchlist, log) = ready_watchlist(config);

  let mut request1 = market_price_request(10, "IBM.N");
  request1.view = Some(ViewDefinition::FieldIdList(vec![22, 25]));
  let mut request2 = market_price_request(11, "IBM.N");
  request2.view = Some(ViewDefinition::FieldIdList(vec![22, 31]));
  submit_item(&mut watchlist, request1, 0);
  submit_item(&mut watchlist, request2, 0);
  watchlist.dispatch(0).unwrap();

  let first_view = log
    .borrow()
    .iter()
    .find_map(|m| match m {
      OutboundMsg::Request(r) => r.view.clone(),
      _ => None,
    })
    .expect("request with view");
  assert_eq!(first_view, ViewDefinition::FieldIdList(vec![22, 25, 31]));

  let sid = upstream_id(&watchlist, 10);
  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid)))),
      1,
    )
    .unwrap();
  drain_events(&mut watchlist);
  log.borrow_mut().clear();

  // Closing request 10 drops field 25 from the next upstream request.
  watchlist
    .submit_msg(
      SubmitOptions {
        msg: SubmitMsg::Item(Msg::Close(crate::rdm::messages::CloseMsg {
          stream_id: 10,
          domain: DomainType::MarketPrice,
        })),
        service_name: None,
        user_handle: None,
      },
      2,
    )
    .unwrap();
  watchlist.dispatch(2).unwrap();

  let second_view = log
    .borrow()
    .iter()
    .find_map(|m| match m {
      OutboundMsg::Request(r) => r.view.clone(),
      _ => None,
    })
    .expect("request resent after view change");
  assert_eq!(second_view, ViewDefinition::FieldIdList(vec![22, 31]));
}

#[test]
fn view_type_mismatch_rejected_on_shared_stream() {
  let config = WatchlistConfig {
    support_view_requests: true,
    ..WatchlistConfig::default()
  };
  let (mut watchlist, _log) = ready_watchlist(config);
  let mut request1 = market_price_request(10, "IBM.N");
  request1.view = Some(ViewDefinition::FieldIdList(vec![22]));
  let mut request2 = market_price_request(11, "IBM.N");
  request2.view = Some(ViewDefinition::ElementNameList(vec!["BID".to_string()]));
  submit_item(&mut watchlist, request1, 0);
  submit_item(&mut watchlist, request2, 0);
  watchlist.dispatch(0).unwrap();

  let events = drain_events(&mut watchlist);
  let statuses = item_status_states(&events);
  assert!(statuses.iter().any(|(id, state)| {
    *id == 11 && state.text == "Requested view type does not match existing stream."
  }));
  assert!(!watchlist.requests.contains_key(&11));
}

// ----------------------------------------------------------------------
// S5: gap detection

#[test]
fn s5_broadcast_gap_sets_timer_and_recovers() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);

  // Solicited refresh (unicast, seq 1) anchors the sequence.
  watchlist
    .read_msg(
      ReadOptions {
        msg: InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid))),
        seq_num: Some(1),
        ft_group_id: None,
      },
      0,
    )
    .unwrap();
  drain_events(&mut watchlist);

  let broadcast_key = {
    let mut key = MsgKey::with_name("IBM.N");
    key.service_id = Some(1);
    key
  };
  let broadcast = |seq: u32| ReadOptions {
    msg: InboundMsg::Item(Msg::Update(UpdateMsg {
      stream_id: 0,
      domain: DomainType::MarketPrice,
      msg_key: Some(broadcast_key.clone()),
      payload: Payload::None,
    })),
    seq_num: Some(seq),
    ft_group_id: None,
  };

  watchlist.read_msg(broadcast(2), 10).unwrap();
  assert_eq!(drain_events(&mut watchlist).len(), 1);

  // Sequence 4 leaves a gap after 2: buffered, timer armed.
  watchlist.read_msg(broadcast(4), 20).unwrap();
  assert!(drain_events(&mut watchlist).is_empty());
  let gap_timeout = watchlist.config().gap_timeout;
  assert_eq!(watchlist.next_timeout(), Some(20 + gap_timeout));

  watchlist.process_timer(20 + gap_timeout).unwrap();
  let events = drain_events(&mut watchlist);
  let statuses = item_status_states(&events);
  assert_eq!(statuses.len(), 1);
  assert_eq!(statuses[0].1.code, StatusCode::GapDetected);
  assert_eq!(statuses[0].1.text, "Gap in sequence number.");
  assert!(!watchlist.streams.contains_key(&sid));
  // Recovered per single-open policy.
  assert!(watchlist.new_requests.contains(&5));
}

#[test]
fn broadcast_before_unicast_anchor_is_buffered() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);

  let mut key = MsgKey::with_name("IBM.N");
  key.service_id = Some(1);
  watchlist
    .read_msg(
      ReadOptions {
        msg: InboundMsg::Item(Msg::Update(UpdateMsg {
          stream_id: 0,
          domain: DomainType::MarketPrice,
          msg_key: Some(key),
          payload: Payload::None,
        })),
        seq_num: Some(3),
        ft_group_id: None,
      },
      0,
    )
    .unwrap();
  // Nothing forwarded yet; the message waits for the unicast anchor.
  assert!(drain_events(&mut watchlist).is_empty());
  assert_eq!(watchlist.streams[&sid].reorder.len(), 1);

  // The refresh (unicast seq 2) anchors and releases the buffered update.
  watchlist
    .read_msg(
      ReadOptions {
        msg: InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid))),
        seq_num: Some(2),
        ft_group_id: None,
      },
      1,
    )
    .unwrap();
  let events = drain_events(&mut watchlist);
  assert_eq!(events.len(), 2); // refresh, then the buffered update
  assert!(matches!(&events[0].msg, EventMsg::Item(Msg::Refresh(_))));
  assert!(matches!(&events[1].msg, EventMsg::Item(Msg::Update(_))));
  assert_eq!(events[1].seq_num, Some(3));
}

// ----------------------------------------------------------------------
// S6: FT group timeout

#[test]
fn s6_ft_group_timeout_recovers_member_streams() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  submit_item(&mut watchlist, market_price_request(6, "GOOG.O"), 0);
  watchlist.dispatch(0).unwrap();
  let sid1 = upstream_id(&watchlist, 5);
  let sid2 = upstream_id(&watchlist, 6);

  for sid in [sid1, sid2] {
    watchlist
      .read_msg(
        ReadOptions {
          msg: InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid))),
          seq_num: None,
          ft_group_id: Some(7),
        },
        0,
      )
      .unwrap();
  }
  drain_events(&mut watchlist);
  assert_eq!(watchlist.ft_groups.streams(7), &[sid1, sid2]);

  let ping_timeout = 60_000;
  assert_eq!(watchlist.next_timeout(), Some(ping_timeout));
  watchlist.process_timer(ping_timeout).unwrap();

  let events = drain_events(&mut watchlist);
  let statuses = item_status_states(&events);
  assert_eq!(statuses.len(), 2);
  for (_, state) in &statuses {
    assert_eq!(state.code, StatusCode::Timeout);
    assert_eq!(state.text, "Fault-tolerant Group timeout.");
  }
  assert!(watchlist.ft_groups.is_empty());
}

#[test]
fn ft_group_ping_extends_deadline() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);
  watchlist
    .read_msg(
      ReadOptions {
        msg: InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid))),
        seq_num: None,
        ft_group_id: Some(7),
      },
      0,
    )
    .unwrap();
  drain_events(&mut watchlist);

  assert_eq!(watchlist.process_ft_group_ping(7, 30_000), Some(90_000));
  assert_eq!(watchlist.next_timeout(), Some(90_000));
  // A ping for an unknown group does nothing.
  assert_eq!(watchlist.process_ft_group_ping(8, 30_000), None);
}

// ----------------------------------------------------------------------
// S7: post acknowledgement timeout

#[test]
fn s7_post_ack_timeout_synthesizes_nak() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);
  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid)))),
      0,
    )
    .unwrap();
  drain_events(&mut watchlist);
  log.borrow_mut().clear();

  watchlist
    .submit_msg(
      SubmitOptions {
        msg: SubmitMsg::Item(Msg::Post(PostMsg {
          stream_id: 5,
          domain: DomainType::MarketPrice,
          msg_key: None,
          post_id: Some(42),
          seq_num: Some(7),
          ack_requested: true,
          payload: Payload::None,
        })),
        service_name: None,
        user_handle: None,
      },
      10,
    )
    .unwrap();
  assert!(matches!(
    log.borrow().last(),
    Some(OutboundMsg::Post(p)) if p.stream_id == sid
  ));

  let deadline = 10 + watchlist.config().post_ack_timeout;
  assert_eq!(watchlist.next_timeout(), Some(deadline));
  watchlist.process_timer(deadline).unwrap();

  let events = drain_events(&mut watchlist);
  let ack = events
    .iter()
    .find_map(|e| match &e.msg {
      EventMsg::Item(Msg::Ack(ack)) => Some(ack.clone()),
      _ => None,
    })
    .expect("synthesized ack");
  assert_eq!(ack.stream_id, 5);
  assert_eq!(ack.ack_id, 42);
  assert_eq!(ack.seq_num, Some(7));
  assert_eq!(ack.nak_code, Some(NakCode::NoResponse));
  assert_eq!(ack.text.as_deref(), Some("Acknowledgement timed out."));
  assert!(watchlist.post_table.is_empty());
}

#[test]
fn post_to_unestablished_stream_is_rejected() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();

  let result = watchlist.submit_msg(
    SubmitOptions {
      msg: SubmitMsg::Item(Msg::Post(PostMsg {
        stream_id: 5,
        domain: DomainType::MarketPrice,
        msg_key: None,
        post_id: Some(1),
        seq_num: None,
        ack_requested: true,
        payload: Payload::None,
      })),
      service_name: None,
      user_handle: None,
    },
    0,
  );
  assert!(result.is_err());
}

// ----------------------------------------------------------------------
// Timeouts and admission

#[test]
fn request_timeout_recovers_stream() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  drain_events(&mut watchlist);
  log.borrow_mut().clear();

  let deadline = watchlist.config().request_timeout;
  assert_eq!(watchlist.next_timeout(), Some(deadline));
  watchlist.process_timer(deadline).unwrap();

  let events = drain_events(&mut watchlist);
  let statuses = item_status_states(&events);
  assert_eq!(statuses.len(), 1);
  assert_eq!(statuses[0].1.code, StatusCode::Timeout);
  assert_eq!(statuses[0].1.text, "Request timed out.");
  // Recovered: re-requested on the next dispatch.
  watchlist.dispatch(deadline + 1).unwrap();
  assert!(log
    .borrow()
    .iter()
    .any(|m| matches!(m, OutboundMsg::Request(r) if r.msg_key.name.as_deref() == Some("IBM.N"))));
}

#[test]
fn open_window_defers_second_stream() {
  let mut service = direct_feed(1);
  service.load = Some(ServiceLoad {
    open_window: Some(1),
    ..ServiceLoad::default()
  });
  let (mut watchlist, log) = ready_watchlist_with_service(WatchlistConfig::default(), service);

  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  submit_item(&mut watchlist, market_price_request(6, "GOOG.O"), 0);
  watchlist.dispatch(0).unwrap();

  let sent: Vec<String> = log
    .borrow()
    .iter()
    .filter_map(|m| match m {
      OutboundMsg::Request(r) => r.msg_key.name.clone(),
      _ => None,
    })
    .collect();
  assert_eq!(sent, vec!["IBM.N"]); // GOOG waits for the window

  let sid = upstream_id(&watchlist, 5);
  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid)))),
      1,
    )
    .unwrap();
  watchlist.dispatch(1).unwrap();
  let sent: Vec<String> = log
    .borrow()
    .iter()
    .filter_map(|m| match m {
      OutboundMsg::Request(r) => r.msg_key.name.clone(),
      _ => None,
    })
    .collect();
  assert_eq!(sent, vec!["IBM.N", "GOOG.O"]);
}

// ----------------------------------------------------------------------
// Service matching failures

#[test]
fn unknown_service_yields_suspect_status_under_single_open() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  watchlist
    .submit_msg(
      SubmitOptions {
        msg: SubmitMsg::Item(Msg::Request(market_price_request(5, "IBM.N"))),
        service_name: Some("NO_SUCH_FEED".to_string()),
        user_handle: None,
      },
      0,
    )
    .unwrap();
  watchlist.dispatch(0).unwrap();

  let events = drain_events(&mut watchlist);
  let statuses = item_status_states(&events);
  assert_eq!(statuses.len(), 1);
  assert_eq!(statuses[0].1.stream_state, StreamState::Open);
  assert_eq!(statuses[0].1.text, "No matching service present.");
  assert!(watchlist.requests.contains_key(&5)); // still waiting
}

#[test]
fn unknown_service_closes_request_without_single_open() {
  let config = WatchlistConfig {
    single_open: false,
    ..WatchlistConfig::default()
  };
  let (mut watchlist, _log) = ready_watchlist(config);
  watchlist
    .submit_msg(
      SubmitOptions {
        msg: SubmitMsg::Item(Msg::Request(market_price_request(5, "IBM.N"))),
        service_name: Some("NO_SUCH_FEED".to_string()),
        user_handle: None,
      },
      0,
    )
    .unwrap();
  watchlist.dispatch(0).unwrap();

  let events = drain_events(&mut watchlist);
  let statuses = item_status_states(&events);
  assert_eq!(statuses.len(), 1);
  assert_eq!(statuses[0].1.stream_state, StreamState::ClosedRecover);
  assert!(!watchlist.requests.contains_key(&5));
}

#[test]
fn unsupported_domain_is_refused() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  let mut request = market_price_request(5, "IBM.N");
  request.domain = DomainType::Dictionary; // not in DIRECT_FEED capabilities
  submit_item(&mut watchlist, request, 0);
  watchlist.dispatch(0).unwrap();
  let events = drain_events(&mut watchlist);
  let statuses = item_status_states(&events);
  assert_eq!(statuses[0].1.text, "Domain not supported by service.");
}

// ----------------------------------------------------------------------
// Directory requests

#[test]
fn directory_request_is_served_from_cache_with_filter() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  watchlist
    .submit_msg(
      SubmitOptions {
        msg: SubmitMsg::Directory(DirectoryMsg::Request(DirectoryRequest {
          stream_id: 20,
          filter: ServiceFilterFlag::Info | ServiceFilterFlag::State,
          service: ServiceSpec::ByName("DIRECT_FEED".to_string()),
          streaming: true,
        })),
        service_name: None,
        user_handle: Some(9),
      },
      0,
    )
    .unwrap();
  watchlist.dispatch(0).unwrap();

  let events = drain_events(&mut watchlist);
  let refresh = events
    .iter()
    .find_map(|e| match &e.msg {
      EventMsg::Directory(DirectoryMsg::Refresh(r)) => Some(r.clone()),
      _ => None,
    })
    .expect("directory refresh from cache");
  assert_eq!(refresh.stream_id, 20);
  assert_eq!(refresh.services.len(), 1);
  assert!(refresh.services[0].info.is_some());
  assert!(refresh.services[0].state.is_some());
  assert!(refresh.services[0].load.is_none()); // filtered out
  assert_eq!(events[0].stream_info.user_handle, Some(9));
}

#[test]
fn non_streaming_directory_request_closes_after_refresh() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  watchlist
    .submit_msg(
      SubmitOptions {
        msg: SubmitMsg::Directory(DirectoryMsg::Request(DirectoryRequest {
          stream_id: 20,
          filter: crate::rdm::all_service_filters(),
          service: ServiceSpec::All,
          streaming: false,
        })),
        service_name: None,
        user_handle: None,
      },
      0,
    )
    .unwrap();
  watchlist.dispatch(0).unwrap();
  let events = drain_events(&mut watchlist);
  assert!(matches!(
    &events[0].msg,
    EventMsg::Directory(DirectoryMsg::Refresh(r))
      if r.state.stream_state == StreamState::NonStreaming
  ));
  assert!(!watchlist.requests.contains_key(&20));
}

// ----------------------------------------------------------------------
// Pause / resume

#[test]
fn all_paused_requests_send_pause_flag() {
  let config = WatchlistConfig {
    support_optimized_pause_resume: true,
    ..WatchlistConfig::default()
  };
  let (mut watchlist, log) = ready_watchlist(config);
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);
  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Item(Msg::Refresh(solicited_complete_refresh(sid)))),
      0,
    )
    .unwrap();
  drain_events(&mut watchlist);
  log.borrow_mut().clear();

  // Reissue with pause.
  let mut paused = market_price_request(5, "IBM.N");
  paused.flags |= RequestFlag::Pause | RequestFlag::NoRefresh;
  submit_item(&mut watchlist, paused, 1);
  watchlist.dispatch(1).unwrap();

  let pause_sent = log.borrow().iter().any(|m| {
    matches!(m, OutboundMsg::Request(r) if r.flags.contains(RequestFlag::Pause))
  });
  assert!(pause_sent);
}

// ----------------------------------------------------------------------
// Reissue validation

#[test]
fn reissue_validation_rejects_immutable_changes() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();

  // Different key.
  let result = watchlist.submit_msg(
    SubmitOptions {
      msg: SubmitMsg::Item(Msg::Request(market_price_request(5, "GOOG.O"))),
      service_name: Some("DIRECT_FEED".to_string()),
      user_handle: None,
    },
    1,
  );
  assert!(result.is_err());

  // Removing the streaming flag.
  let mut snapshot = market_price_request(5, "IBM.N");
  snapshot.flags.remove(RequestFlag::Streaming);
  let result = watchlist.submit_msg(
    SubmitOptions {
      msg: SubmitMsg::Item(Msg::Request(snapshot)),
      service_name: Some("DIRECT_FEED".to_string()),
      user_handle: None,
    },
    1,
  );
  assert!(result.is_err());

  // Adding the private flag.
  let mut private = market_price_request(5, "IBM.N");
  private.flags |= RequestFlag::PrivateStream;
  let result = watchlist.submit_msg(
    SubmitOptions {
      msg: SubmitMsg::Item(Msg::Request(private)),
      service_name: Some("DIRECT_FEED".to_string()),
      user_handle: None,
    },
    1,
  );
  assert!(result.is_err());
}

#[test]
fn pause_only_reissue_is_accepted() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);

  // Pausing drops the streaming flag and sets pause; this is how an item
  // is paused, not a request to stop streaming.
  let mut paused = RequestMsg::new(5, DomainType::MarketPrice, MsgKey::with_name("IBM.N"));
  paused.flags |= RequestFlag::Pause | RequestFlag::NoRefresh;
  let result = watchlist.submit_msg(
    SubmitOptions {
      msg: SubmitMsg::Item(Msg::Request(paused)),
      service_name: Some("DIRECT_FEED".to_string()),
      user_handle: None,
    },
    1,
  );
  assert!(result.is_ok());

  let stream = &watchlist.streams[&sid];
  assert_eq!(stream.paused_count, 1);
  assert_eq!(stream.streaming_count, 1); // the request is still streaming
  match watchlist.requests.get(&5) {
    Some(WlRequest::Item(request)) => {
      assert!(request.is_streaming());
      assert!(request.is_paused());
    }
    _ => panic!("request 5 missing"),
  }
}

#[test]
fn priority_reissue_triggers_resend() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  log.borrow_mut().clear();

  let mut reissue = market_price_request(5, "IBM.N");
  reissue.flags |= RequestFlag::NoRefresh;
  reissue.priority = Some(Priority { class: 3, count: 1 });
  submit_item(&mut watchlist, reissue, 1);
  watchlist.dispatch(1).unwrap();

  let priorities: Vec<Option<Priority>> = log
    .borrow()
    .iter()
    .filter_map(|m| match m {
      OutboundMsg::Request(r) => Some(r.priority),
      _ => None,
    })
    .collect();
  assert_eq!(priorities, vec![Some(Priority { class: 3, count: 1 })]);
}

// ----------------------------------------------------------------------
// Symbol list data streams

#[test]
fn symbol_list_entries_spawn_provider_driven_streams() {
  let (mut watchlist, log) = ready_watchlist(WatchlistConfig::default());
  let mut request = RequestMsg::new(5, DomainType::SymbolList, MsgKey::with_name("FTSE"));
  request.flags |= RequestFlag::Streaming;
  request.symbol_list_behaviors = Some(SymbolListFlags(SymbolListFlags::DATA_STREAMS));
  submit_item(&mut watchlist, request, 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);
  log.borrow_mut().clear();

  let mut refresh = solicited_complete_refresh(sid);
  refresh.domain = DomainType::SymbolList;
  refresh.payload = Payload::SymbolList(vec![
    SymbolListEntry {
      action: MapEntryAction::Add,
      name: "IBM.N".to_string(),
    },
    SymbolListEntry {
      action: MapEntryAction::Add,
      name: "GOOG.O".to_string(),
    },
  ]);
  watchlist
    .read_msg(ReadOptions::msg(InboundMsg::Item(Msg::Refresh(refresh))), 1)
    .unwrap();
  watchlist.dispatch(1).unwrap();

  // Two provider-driven market-price requests, negative ids, streaming.
  let derived: Vec<&str> = log
    .borrow()
    .iter()
    .filter_map(|m| match m {
      OutboundMsg::Request(r) if r.domain == DomainType::MarketPrice => {
        r.msg_key.name.as_deref().map(|n| match n {
          "IBM.N" => "IBM.N",
          "GOOG.O" => "GOOG.O",
          _ => "?",
        })
      }
      _ => None,
    })
    .collect();
  assert_eq!(derived.len(), 2);
  assert_eq!(watchlist.provider_requests_by_attrib.len(), 2);
  assert!(watchlist.requests.keys().any(|id| *id < 0));

  // Duplicate entries are suppressed.
  let update = UpdateMsg {
    stream_id: sid,
    domain: DomainType::SymbolList,
    msg_key: None,
    payload: Payload::SymbolList(vec![SymbolListEntry {
      action: MapEntryAction::Update,
      name: "IBM.N".to_string(),
    }]),
  };
  watchlist
    .read_msg(ReadOptions::msg(InboundMsg::Item(Msg::Update(update))), 2)
    .unwrap();
  assert_eq!(watchlist.provider_requests_by_attrib.len(), 2);
}

#[test]
fn symbol_list_with_both_behaviors_is_invalid() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  let mut request = RequestMsg::new(5, DomainType::SymbolList, MsgKey::with_name("FTSE"));
  request.symbol_list_behaviors = Some(SymbolListFlags(
    SymbolListFlags::DATA_STREAMS | SymbolListFlags::DATA_SNAPSHOTS,
  ));
  let result = watchlist.submit_msg(
    SubmitOptions {
      msg: SubmitMsg::Item(Msg::Request(request)),
      service_name: Some("DIRECT_FEED".to_string()),
      user_handle: None,
    },
    0,
  );
  assert!(result.is_err());
}

// ----------------------------------------------------------------------
// Item groups

#[test]
fn group_status_fans_out_to_member_streams() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  let sid = upstream_id(&watchlist, 5);

  let mut refresh = solicited_complete_refresh(sid);
  refresh.group_id = Some(bytes::Bytes::from_static(b"\x00\x01"));
  watchlist
    .read_msg(ReadOptions::msg(InboundMsg::Item(Msg::Refresh(refresh))), 0)
    .unwrap();
  drain_events(&mut watchlist);

  // Group status arrives via a directory update.
  let mut service = Service::new(1, MapEntryAction::Update);
  service.group_states.push(crate::rdm::directory::ServiceGroupState {
    group: bytes::Bytes::from_static(b"\x00\x01"),
    merged_to_group: None,
    status: Some(State::open_suspect().with_text("Group suspect.")),
  });
  watchlist
    .read_msg(
      ReadOptions::msg(InboundMsg::Directory(DirectoryMsg::Update(
        crate::rdm::directory::DirectoryUpdate {
          stream_id: super::DIRECTORY_STREAM_ID,
          filter: crate::rdm::all_service_filters(),
          service_id: None,
          services: vec![service],
        },
      ))),
      1,
    )
    .unwrap();
  let events = drain_events(&mut watchlist);
  let statuses = item_status_states(&events);
  assert!(statuses
    .iter()
    .any(|(id, state)| *id == 5 && state.text == "Group suspect."));
}

// ----------------------------------------------------------------------
// Teardown

#[test]
fn destroy_fans_closed_status_and_empties_tables() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  submit_item(&mut watchlist, market_price_request(5, "IBM.N"), 0);
  watchlist.dispatch(0).unwrap();
  drain_events(&mut watchlist);

  watchlist.destroy();
  let events = drain_events(&mut watchlist);
  assert!(events.iter().any(|e| matches!(
    &e.msg,
    EventMsg::Item(Msg::Status(s))
      if s.stream_id == 5
        && s.state.as_ref().unwrap().stream_state == StreamState::Closed
  )));
  assert!(watchlist.requests.is_empty());
  assert!(watchlist.streams.is_empty());
  assert!(watchlist.post_table.is_empty());
  assert!(watchlist.next_timeout().is_none());
}

#[test]
fn unsupported_consumer_message_is_rejected() {
  let (mut watchlist, _log) = ready_watchlist(WatchlistConfig::default());
  let result = watchlist.submit_msg(
    SubmitOptions {
      msg: SubmitMsg::Item(Msg::Status(StatusMsg::new(
        5,
        DomainType::MarketPrice,
        State::open_ok(),
      ))),
      service_name: None,
      user_handle: None,
    },
    0,
  );
  assert!(result.is_err());
}
