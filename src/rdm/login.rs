use super::state::State;

/// Role of the login: this engine only issues consumer logins, but the
/// value is carried through verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginRole {
  #[default]
  Consumer,
  Provider,
}

/// RDM Login request attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
  pub stream_id: i32,
  pub user_name: String,
  pub password: Option<String>,
  pub application_id: Option<String>,
  pub position: Option<String>,
  pub instance_id: Option<String>,
  pub authentication_extended: Option<String>,
  pub role: LoginRole,
  /// Pause every open streaming item (optimized pause).
  pub pause_all: bool,
  pub no_refresh: bool,
}

impl LoginRequest {
  pub fn new(stream_id: i32, user_name: &str) -> Self {
    Self {
      stream_id,
      user_name: user_name.to_string(),
      password: None,
      application_id: None,
      position: None,
      instance_id: None,
      authentication_extended: None,
      role: LoginRole::Consumer,
      pause_all: false,
      no_refresh: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRefresh {
  pub stream_id: i32,
  pub state: State,
  pub user_name: Option<String>,
  pub solicited: bool,
  /// Provider supports optimized pause/resume on this session.
  pub supports_optimized_pause_resume: bool,
  pub supports_post: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStatus {
  pub stream_id: i32,
  pub state: Option<State>,
}

/// Any RDM login-domain message the engine handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMsg {
  Request(LoginRequest),
  Refresh(LoginRefresh),
  Status(LoginStatus),
}

impl LoginMsg {
  pub fn state(&self) -> Option<&State> {
    match self {
      LoginMsg::Request(_) => None,
      LoginMsg::Refresh(refresh) => Some(&refresh.state),
      LoginMsg::Status(status) => status.state.as_ref(),
    }
  }

  pub fn set_stream_id(&mut self, stream_id: i32) {
    match self {
      LoginMsg::Request(m) => m.stream_id = stream_id,
      LoginMsg::Refresh(m) => m.stream_id = stream_id,
      LoginMsg::Status(m) => m.stream_id = stream_id,
    }
  }
}
