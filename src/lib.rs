//! # rdm-watchlist
//!
//! A sans-I/O, single-threaded watchlist engine for RDM streaming market
//! data. The engine sits between an application issuing item requests and a
//! wire-level RDM session: it multiplexes many logical subscriptions onto
//! one network session and hides the login handshake, directory discovery,
//! service state, request aggregation, recovery, sequenced delivery, and
//! post-acknowledgement timing.
//!
//! The engine performs no I/O and spawns no threads: the host drives it by
//! submitting application messages, delivering provider messages, and
//! calling [`watchlist::Watchlist::dispatch`] and
//! [`watchlist::Watchlist::process_timer`] against its own clock. Events
//! destined for the application are drained with
//! [`watchlist::Watchlist::poll_event`].
//!
//! ```
//! use rdm_watchlist::{
//!   rdm::{LoginMsg, LoginRequest},
//!   watchlist::{SubmitMsg, SubmitOptions, Watchlist, WatchlistConfig},
//! };
//!
//! let mut watchlist = Watchlist::new(WatchlistConfig::default());
//! watchlist
//!   .submit_msg(
//!     SubmitOptions {
//!       msg: SubmitMsg::Login(LoginMsg::Request(LoginRequest::new(1, "user"))),
//!       service_name: None,
//!       user_handle: Some(7),
//!     },
//!     0,
//!   )
//!   .unwrap();
//! // ... bind a channel, then drive dispatch()/read_msg()/process_timer().
//! ```

pub mod rdm;
pub mod watchlist;

pub use rdm::{
  DataState, DomainType, MsgKey, Qos, QosRate, QosTimeliness, State, StatusCode, StreamState,
};
pub use watchlist::{
  channel::{Channel, ChannelInfo, ChannelState, OutboundMsg, WriteOutcome},
  config::WatchlistConfig,
  error::WatchlistError,
  events::{EventFlag, EventMsg, MsgEvent, StreamInfo},
  InboundMsg, ReadOptions, SubmitMsg, SubmitOptions, Watchlist,
};
