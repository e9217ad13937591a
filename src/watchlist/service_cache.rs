//! Canonical store of directory services.
//!
//! The cache is the source of truth for service identity, capability and
//! state; the directory stream merely keeps it fresh. Every mutation
//! produces a change list that the engine fans out to directory requests
//! and uses to drive item recovery.

use std::collections::HashMap;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::rdm::{
  directory::{Service, ServiceInfo, ServiceLoad, ServiceState},
  types::MapEntryAction,
};

/// One cache mutation, in fanout form: `service` carries only the sections
/// that actually changed, so directory updates forward exactly what moved.
#[derive(Debug, Clone)]
pub struct ServiceUpdate {
  pub action: MapEntryAction,
  pub service_id: u16,
  /// Previous name, when this update renamed the service.
  pub old_name: Option<String>,
  pub service: Service,
}

/// Canonical form of one service. Absent wire sections read as defaults
/// (a service with no state filter is up and accepting).
#[derive(Debug, Clone, Default)]
pub struct CachedService {
  pub service_id: u16,
  pub info: ServiceInfo,
  pub state: ServiceState,
  pub load: ServiceLoad,
}

impl CachedService {
  pub fn name(&self) -> &str {
    &self.info.service_name
  }

  pub fn has_capability(&self, domain: u16) -> bool {
    self.info.capabilities.binary_search(&domain).is_ok()
  }

  /// Full-image snapshot used when synthesizing a refresh from cache.
  pub fn snapshot(&self) -> Service {
    Service {
      service_id: self.service_id,
      action: MapEntryAction::Add,
      info: Some(self.info.clone()),
      state: Some(self.state.clone()),
      load: Some(self.load.clone()),
      group_states: Vec::new(),
      data: None,
      links: Vec::new(),
    }
  }
}

#[derive(Debug, Default)]
pub struct ServiceCache {
  by_id: HashMap<u16, CachedService>,
  name_to_id: HashMap<String, u16>,
}

impl ServiceCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, service_id: u16) -> Option<&CachedService> {
    self.by_id.get(&service_id)
  }

  pub fn id_by_name(&self, name: &str) -> Option<u16> {
    self.name_to_id.get(name).copied()
  }

  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }

  pub fn service_ids(&self) -> Vec<u16> {
    let mut ids: Vec<u16> = self.by_id.keys().copied().collect();
    ids.sort_unstable();
    ids
  }

  /// Snapshots for a synthesized refresh: all services, one by id, or one
  /// by name.
  pub fn snapshot_all(&self) -> Vec<Service> {
    self
      .service_ids()
      .iter()
      .filter_map(|id| self.by_id.get(id))
      .map(CachedService::snapshot)
      .collect()
  }

  pub fn snapshot_by_id(&self, service_id: u16) -> Vec<Service> {
    self
      .by_id
      .get(&service_id)
      .map(|s| vec![s.snapshot()])
      .unwrap_or_default()
  }

  pub fn snapshot_by_name(&self, name: &str) -> Vec<Service> {
    self
      .id_by_name(name)
      .map(|id| self.snapshot_by_id(id))
      .unwrap_or_default()
  }

  /// Applies a full directory refresh. Services absent from the image are
  /// deleted; present ones are added or updated.
  pub fn apply_refresh(&mut self, services: &[Service]) -> Vec<ServiceUpdate> {
    let mut updates = Vec::new();
    let mentioned: Vec<u16> = services.iter().map(|s| s.service_id).collect();
    let stale: Vec<u16> = self
      .service_ids()
      .into_iter()
      .filter(|id| !mentioned.contains(id))
      .collect();
    for id in stale {
      updates.extend(self.delete_service(id));
    }
    for service in services {
      updates.extend(self.apply_entry(service));
    }
    updates
  }

  /// Applies a directory update message.
  pub fn apply_update(&mut self, services: &[Service]) -> Vec<ServiceUpdate> {
    services
      .iter()
      .flat_map(|s| self.apply_entry(s))
      .collect()
  }

  /// Deletes everything, producing delete events for each service. Used on
  /// channel loss and login recovery; the engine turns the deletions into
  /// ClosedRecover fanout for every open item stream.
  pub fn clear(&mut self) -> Vec<ServiceUpdate> {
    let updates = self
      .service_ids()
      .into_iter()
      .filter_map(|id| self.delete_service(id))
      .collect();
    debug!("service cache cleared");
    updates
  }

  fn apply_entry(&mut self, service: &Service) -> Option<ServiceUpdate> {
    match service.action {
      MapEntryAction::Delete => self.delete_service(service.service_id),
      MapEntryAction::Add | MapEntryAction::Update => {
        let existed = self.by_id.contains_key(&service.service_id);
        let cached = self
          .by_id
          .entry(service.service_id)
          .or_insert_with(|| CachedService {
            service_id: service.service_id,
            ..CachedService::default()
          });

        let mut old_name = None;
        let mut fanout = Service::new(
          service.service_id,
          if existed {
            MapEntryAction::Update
          } else {
            MapEntryAction::Add
          },
        );

        if let Some(info) = &service.info {
          let previous_name = cached.info.service_name.clone();
          cached.info = info.clone();
          cached.info.capabilities.sort_unstable();
          if existed && !previous_name.is_empty() && previous_name != info.service_name {
            old_name = Some(previous_name);
          }
          fanout.info = Some(cached.info.clone());
        }
        if let Some(state) = &service.state {
          cached.state = state.clone();
          fanout.state = Some(state.clone());
        }
        if let Some(load) = &service.load {
          cached.load = load.clone();
          fanout.load = Some(load.clone());
        }
        fanout.group_states = service.group_states.clone();
        fanout.data = service.data.clone();
        fanout.links = service.links.clone();

        // Refresh the name index.
        if let Some(old) = &old_name {
          self.name_to_id.remove(old);
        }
        if !cached.info.service_name.is_empty() {
          self
            .name_to_id
            .insert(cached.info.service_name.clone(), service.service_id);
        }

        Some(ServiceUpdate {
          action: fanout.action,
          service_id: service.service_id,
          old_name,
          service: fanout,
        })
      }
    }
  }

  fn delete_service(&mut self, service_id: u16) -> Option<ServiceUpdate> {
    let cached = self.by_id.remove(&service_id)?;
    self.name_to_id.remove(cached.name());
    trace!("service {service_id} deleted from cache");
    Some(ServiceUpdate {
      action: MapEntryAction::Delete,
      service_id,
      old_name: None,
      service: Service::new(service_id, MapEntryAction::Delete),
    })
  }
}
