use bytes::Bytes;

/// Key identifying a requested item within a service.
///
/// Field presence doubles as the "has"-flags of the wire form: a `None`
/// field is an absent key member. `attrib` is an encoded attribute payload
/// the engine never interprets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MsgKey {
  pub name: Option<String>,
  pub name_type: Option<u8>,
  pub service_id: Option<u16>,
  pub filter: Option<u32>,
  pub identifier: Option<i32>,
  pub attrib: Option<Bytes>,
}

impl MsgKey {
  pub fn with_name(name: &str) -> Self {
    Self {
      name: Some(name.to_string()),
      ..Self::default()
    }
  }

  pub fn has_name(&self) -> bool {
    self.name.is_some()
  }

  pub fn has_service_id(&self) -> bool {
    self.service_id.is_some()
  }

  /// Key equality ignoring the service id. Used when comparing a reissue
  /// against an existing by-name request, where the engine fills the id in.
  pub fn matches_ignoring_service(&self, other: &MsgKey) -> bool {
    self.name == other.name
      && self.name_type == other.name_type
      && self.filter == other.filter
      && self.identifier == other.identifier
      && self.attrib == other.attrib
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn service_id_ignored_when_asked() {
    let mut a = MsgKey::with_name("IBM.N");
    let mut b = MsgKey::with_name("IBM.N");
    a.service_id = Some(1);
    b.service_id = Some(2);
    assert_ne!(a, b);
    assert!(a.matches_ignoring_service(&b));

    b.name = Some("GOOG.O".to_string());
    assert!(!a.matches_ignoring_service(&b));
  }
}
