//! Recipient registry
//!
//! Read-mostly: every dispatch resolves recipients, registrations are rare
//! (startup seeding and first contact from a chat front door).

use crate::domain::{ChannelKind, FacilityId, RecipientId, RegistryUnavailable};
use crate::infra::config::RecipientConfig;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub channel_addresses: BTreeMap<ChannelKind, String>,
    /// `None` receives alerts from every facility
    pub facility_id: Option<FacilityId>,
}

impl Recipient {
    pub fn address(&self, channel: ChannelKind) -> Option<&str> {
        self.channel_addresses.get(&channel).map(String::as_str)
    }

    fn in_scope(&self, facility: Option<&FacilityId>) -> bool {
        match (facility, &self.facility_id) {
            (None, _) | (_, None) => true,
            (Some(alert_facility), Some(scope)) => alert_facility == scope,
        }
    }
}

/// Lookup seam used by the dispatcher
pub trait RecipientDirectory: Send + Sync {
    /// Add or update a recipient's address on one channel.
    /// Returns true when the recipient was not known before.
    fn register_recipient(
        &self,
        id: RecipientId,
        channel: ChannelKind,
        address: String,
        facility: Option<FacilityId>,
    ) -> Result<bool, RegistryUnavailable>;

    /// Recipients who should receive alerts for `facility`, sorted by id
    fn resolve(&self, facility: Option<&FacilityId>) -> Result<Vec<Recipient>, RegistryUnavailable>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct RecipientRegistry {
    recipients: RwLock<FxHashMap<RecipientId, Recipient>>,
}

impl RecipientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `[[recipients]]` config entries.
    /// Unknown channel keys are skipped with a warning.
    pub fn from_config(entries: &[RecipientConfig]) -> Self {
        let registry = Self::new();
        for entry in entries {
            let facility = entry.facility_id.clone().map(FacilityId);
            for (channel, address) in &entry.channels {
                match channel.parse::<ChannelKind>() {
                    Ok(kind) => {
                        registry.insert(
                            RecipientId::new(entry.id.clone()),
                            kind,
                            address.clone(),
                            facility.clone(),
                        );
                    }
                    Err(e) => {
                        warn!(recipient_id = %entry.id, error = %e, "recipient_channel_skipped")
                    }
                }
            }
        }
        info!(recipients = %registry.len(), "recipient_registry_seeded");
        registry
    }

    fn insert(
        &self,
        id: RecipientId,
        channel: ChannelKind,
        address: String,
        facility: Option<FacilityId>,
    ) -> bool {
        let mut recipients = self.recipients.write();
        match recipients.get_mut(&id) {
            Some(existing) => {
                existing.channel_addresses.insert(channel, address);
                if facility.is_some() {
                    existing.facility_id = facility;
                }
                false
            }
            None => {
                let mut channel_addresses = BTreeMap::new();
                channel_addresses.insert(channel, address);
                recipients
                    .insert(id.clone(), Recipient { id, channel_addresses, facility_id: facility });
                true
            }
        }
    }
}

impl RecipientDirectory for RecipientRegistry {
    fn register_recipient(
        &self,
        id: RecipientId,
        channel: ChannelKind,
        address: String,
        facility: Option<FacilityId>,
    ) -> Result<bool, RegistryUnavailable> {
        Ok(self.insert(id, channel, address, facility))
    }

    fn resolve(&self, facility: Option<&FacilityId>) -> Result<Vec<Recipient>, RegistryUnavailable> {
        let recipients = self.recipients.read();
        let mut matched: Vec<Recipient> =
            recipients.values().filter(|r| r.in_scope(facility)).cloned().collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    fn len(&self) -> usize {
        self.recipients.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rid(s: &str) -> RecipientId {
        RecipientId::new(s)
    }

    #[test]
    fn test_register_is_idempotent_and_merges() {
        let registry = RecipientRegistry::new();
        assert!(registry
            .register_recipient(rid("u1"), ChannelKind::PushMessage, "U1".into(), None)
            .unwrap());
        assert!(!registry
            .register_recipient(rid("u1"), ChannelKind::PushMessage, "U1".into(), None)
            .unwrap());
        registry
            .register_recipient(rid("u1"), ChannelKind::EmergencyEscalation, "+8190".into(), None)
            .unwrap();

        assert_eq!(registry.len(), 1);
        let resolved = registry.resolve(None).unwrap();
        assert_eq!(resolved[0].address(ChannelKind::PushMessage), Some("U1"));
        assert_eq!(resolved[0].address(ChannelKind::EmergencyEscalation), Some("+8190"));
    }

    #[test]
    fn test_resolve_by_facility() {
        let registry = RecipientRegistry::new();
        let home_a = FacilityId::new("home-a");
        let home_b = FacilityId::new("home-b");
        registry
            .register_recipient(rid("c"), ChannelKind::PushMessage, "C".into(), Some(home_a.clone()))
            .unwrap();
        registry
            .register_recipient(rid("b"), ChannelKind::PushMessage, "B".into(), Some(home_b.clone()))
            .unwrap();
        registry.register_recipient(rid("a"), ChannelKind::RichCard, "A".into(), None).unwrap();

        let ids = |v: Vec<Recipient>| v.into_iter().map(|r| r.id.0).collect::<Vec<_>>();
        assert_eq!(ids(registry.resolve(Some(&home_a)).unwrap()), vec!["a", "c"]);
        assert_eq!(ids(registry.resolve(Some(&home_b)).unwrap()), vec!["a", "b"]);
        assert_eq!(ids(registry.resolve(None).unwrap()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_from_config_skips_unknown_channels() {
        let mut channels = HashMap::new();
        channels.insert("push-message".to_string(), "U1".to_string());
        channels.insert("pager".to_string(), "123".to_string());
        let registry = RecipientRegistry::from_config(&[RecipientConfig {
            id: "nurse-1".to_string(),
            facility_id: Some("home-a".to_string()),
            channels,
        }]);

        let resolved = registry.resolve(None).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].channel_addresses.len(), 1);
        assert_eq!(resolved[0].facility_id, Some(FacilityId::new("home-a")));
    }
}
