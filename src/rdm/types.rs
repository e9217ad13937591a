use num_derive::{FromPrimitive, ToPrimitive};

/// RDM domain of a message or stream.
///
/// The numeric values are those of the RDM wire model. Domains above
/// `MarketMaker` are not interpreted by the engine; they are carried through
/// and aggregated like any other item domain, which is why the type keeps an
/// escape hatch via `from_u8`/`to_u8` rather than being `#[non_exhaustive]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum DomainType {
  Login = 1,
  Directory = 4,
  Dictionary = 5,
  MarketPrice = 6,
  MarketByOrder = 7,
  MarketByPrice = 8,
  MarketMaker = 9,
  SymbolList = 10,
}

impl DomainType {
  /// Login and Directory streams are administrative: they are managed by the
  /// engine itself and are exempt from pause-all and item fanout.
  pub fn is_admin(self) -> bool {
    matches!(self, DomainType::Login | DomainType::Directory)
  }
}

/// View type of a field projection, as carried in `:ViewType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum ViewType {
  FieldIdList = 1,
  ElementNameList = 2,
}

/// Filter ids of the source directory filter entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FilterId {
  Info = 1,
  State = 2,
  Group = 3,
  Load = 4,
  Data = 5,
  Link = 6,
}

/// Negative-acknowledgement codes carried on an `AckMsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum NakCode {
  None = 0,
  AccessDenied = 1,
  DeniedBySource = 2,
  SourceDown = 3,
  SourceUnknown = 4,
  NoResources = 5,
  NoResponse = 6,
  GatewayDown = 7,
  SymbolUnknown = 10,
  NotOpen = 11,
  InvalidContent = 12,
}

/// Action of an entry in a map payload (symbol lists, directory service maps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum MapEntryAction {
  Update = 1,
  Add = 2,
  Delete = 3,
}

/// Symbol-list behavior bits from `:SymbolListBehaviors` / `:DataStreams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolListFlags(pub u32);

impl SymbolListFlags {
  pub const NAMES_ONLY: u32 = 0x0;
  pub const DATA_STREAMS: u32 = 0x1;
  pub const DATA_SNAPSHOTS: u32 = 0x2;

  pub fn data_streams(self) -> bool {
    self.0 & Self::DATA_STREAMS != 0
  }

  pub fn data_snapshots(self) -> bool {
    self.0 & Self::DATA_SNAPSHOTS != 0
  }

  pub fn wants_data(self) -> bool {
    self.data_streams() || self.data_snapshots()
  }
}

#[cfg(test)]
mod tests {
  use num_traits::FromPrimitive;

  use super::*;

  #[test]
  fn domain_numbers_match_rdm() {
    assert_eq!(DomainType::from_u8(1), Some(DomainType::Login));
    assert_eq!(DomainType::from_u8(4), Some(DomainType::Directory));
    assert_eq!(DomainType::from_u8(6), Some(DomainType::MarketPrice));
    assert_eq!(DomainType::from_u8(10), Some(DomainType::SymbolList));
    assert_eq!(DomainType::from_u8(0), None);
  }

  #[test]
  fn admin_domains() {
    assert!(DomainType::Login.is_admin());
    assert!(DomainType::Directory.is_admin());
    assert!(!DomainType::MarketPrice.is_admin());
    assert!(!DomainType::SymbolList.is_admin());
  }
}
