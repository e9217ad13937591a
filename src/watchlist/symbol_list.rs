//! Symbol-list data-stream expansion: entries of a watched symbol list can
//! spawn provider-driven market-price streams.

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::rdm::{
  messages::{Msg, Payload, RequestFlag, RequestMsg},
  msg_key::MsgKey,
  qos::Qos,
  types::{DomainType, MapEntryAction},
};

use super::{
  error::{Result, WatchlistError},
  items::{ItemRequestFlag, ProviderRequestKey},
  ServiceKey, Watchlist, WlRequest,
};

impl Watchlist {
  /// Inspects a symbol-list refresh/update delivered to `request_id` and
  /// opens provider-driven item streams for added or updated entries.
  /// Delete entries do not close derived streams.
  pub(crate) fn process_symbol_list_msg(&mut self, request_id: i32, msg: &Msg) -> Result<()> {
    let (sl_flags, service_key) = {
      let Some(WlRequest::Item(request)) = self.requests.get(&request_id) else {
        return Ok(());
      };
      let Some(symbol_list) = request.symbol_list else {
        return Ok(());
      };
      (symbol_list.flags, request.service_key.clone())
    };
    if !sl_flags.wants_data() {
      return Ok(());
    }

    let entries = match msg {
      Msg::Refresh(refresh) => match &refresh.payload {
        Payload::SymbolList(entries) => entries.clone(),
        _ => return Ok(()),
      },
      Msg::Update(update) => match &update.payload {
        Payload::SymbolList(entries) => entries.clone(),
        _ => return Ok(()),
      },
      _ => return Ok(()),
    };

    let Some(service_id) = self
      .requested_services
      .get(&service_key)
      .and_then(|r| r.matching_service)
    else {
      return Ok(());
    };
    let Some(cached) = self.service_cache.get(service_id) else {
      return Ok(());
    };
    // Data streams are requested by service name.
    if cached.name().is_empty() {
      return Err(WatchlistError::invalid_data(
        "Service for Symbol List stream is missing name. Cannot create data streams.",
      ));
    }
    let service_name = cached.name().to_string();

    // Best QoS the service offers; realtime/tick-by-tick if unlisted.
    let item_qos = cached
      .info
      .qos_list
      .first()
      .copied()
      .unwrap_or_else(Qos::realtime_tick_by_tick);

    let derive_key = if service_key.name().is_some() {
      service_key.clone()
    } else {
      ServiceKey::Id(service_id)
    };

    for entry in entries {
      match entry.action {
        MapEntryAction::Add | MapEntryAction::Update => {
          let provider_key = ProviderRequestKey {
            domain: DomainType::MarketPrice,
            qos: item_qos,
            name: entry.name.clone(),
            service: derive_key.clone(),
          };
          // Streaming items must be unique among provider-driven requests.
          if sl_flags.data_streams()
            && self.provider_requests_by_attrib.contains_key(&provider_key)
          {
            continue;
          }

          let stream_id = self.take_provider_request_id();
          let mut request = RequestMsg::new(
            stream_id,
            DomainType::MarketPrice,
            MsgKey::with_name(&entry.name),
          );
          request.qos = Some(item_qos);
          if sl_flags.data_streams() {
            request.flags |= RequestFlag::Streaming;
          }

          trace!(
            "deriving data stream {stream_id} for symbol {} on {service_name}",
            entry.name
          );
          self.create_item_request(
            request,
            ServiceKey::Name(service_name.clone()),
            None,
            ItemRequestFlag::ProvDriven.into(),
            None,
          )?;
          self
            .provider_requests_by_attrib
            .insert(provider_key, stream_id);
        }
        MapEntryAction::Delete => (),
      }
    }
    Ok(())
  }
}
