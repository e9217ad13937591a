use num_derive::{FromPrimitive, ToPrimitive};
use static_assertions::assert_impl_all;

/// Stream half of an RDM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum StreamState {
  Open = 1,
  /// Stream delivers a final refresh and then closes on its own.
  NonStreaming = 2,
  /// Closed, but the item may be available elsewhere (or later).
  ClosedRecover = 3,
  Closed = 4,
  ClosedRedirected = 5,
}

/// Data half of an RDM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum DataState {
  NoChange = 0,
  Ok = 1,
  Suspect = 2,
}

/// Status code qualifying a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum StatusCode {
  None = 0,
  NotFound = 1,
  Timeout = 2,
  NotAuthorized = 3,
  InvalidArgument = 4,
  UsageError = 5,
  Preempted = 6,
  JustInTimeConflationStarted = 7,
  TickByTickResumed = 8,
  FailoverStarted = 9,
  FailoverCompleted = 10,
  GapDetected = 11,
  NoResources = 12,
  TooManyItems = 13,
  AlreadyOpen = 14,
  SourceUnknown = 15,
  NotOpen = 16,
}

/// An RDM state: stream state, data state, code and optional text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
  pub stream_state: StreamState,
  pub data_state: DataState,
  pub code: StatusCode,
  pub text: String,
}

// State is cloned on every synthesized status; keep it cheap to move around.
assert_impl_all!(State: Send, Sync);

impl State {
  pub fn new(stream_state: StreamState, data_state: DataState) -> Self {
    Self {
      stream_state,
      data_state,
      code: StatusCode::None,
      text: String::new(),
    }
  }

  pub fn with_code(mut self, code: StatusCode) -> Self {
    self.code = code;
    self
  }

  pub fn with_text(mut self, text: &str) -> Self {
    self.text = text.to_string();
    self
  }

  pub fn open_ok() -> Self {
    Self::new(StreamState::Open, DataState::Ok)
  }

  pub fn open_suspect() -> Self {
    Self::new(StreamState::Open, DataState::Suspect)
  }

  pub fn closed_recover_suspect() -> Self {
    Self::new(StreamState::ClosedRecover, DataState::Suspect)
  }

  pub fn is_open(&self) -> bool {
    self.stream_state == StreamState::Open
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builders() {
    let s = State::closed_recover_suspect()
      .with_code(StatusCode::Timeout)
      .with_text("Request timed out.");
    assert_eq!(s.stream_state, StreamState::ClosedRecover);
    assert_eq!(s.data_state, DataState::Suspect);
    assert_eq!(s.code, StatusCode::Timeout);
    assert_eq!(s.text, "Request timed out.");
    assert!(!s.is_open());
    assert!(State::open_ok().is_open());
  }
}
