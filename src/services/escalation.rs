//! Escalation hook applied after each dispatch

use crate::domain::{Alert, ChannelKind};
use crate::infra::config::EscalationMode;
use crate::services::dispatcher::{DeliveryTarget, DispatchReport};
use crate::services::registry::Recipient;
use std::sync::Arc;

pub type EscalationTarget = DeliveryTarget;

pub trait EscalationPolicy: Send + Sync {
    /// Targets to reach on the emergency channel given a finished dispatch.
    /// `recipients` are the ones resolved for the alert.
    fn escalations(
        &self,
        alert: &Alert,
        report: &DispatchReport,
        recipients: &[Recipient],
    ) -> Vec<EscalationTarget>;
}

/// Escalate emergencies for recipients no primary channel reached
pub struct EmergencyFallback;

impl EscalationPolicy for EmergencyFallback {
    fn escalations(
        &self,
        alert: &Alert,
        report: &DispatchReport,
        recipients: &[Recipient],
    ) -> Vec<EscalationTarget> {
        if !alert.level.is_emergency() {
            return Vec::new();
        }

        recipients
            .iter()
            .filter(|r| {
                !report.outcomes.iter().any(|o| o.recipient_id == r.id && o.delivered())
            })
            .filter_map(|r| {
                r.address(ChannelKind::EmergencyEscalation).map(|address| EscalationTarget {
                    recipient_id: r.id.clone(),
                    channel: ChannelKind::EmergencyEscalation,
                    address: address.to_string(),
                })
            })
            .collect()
    }
}

pub struct NoEscalation;

impl EscalationPolicy for NoEscalation {
    fn escalations(&self, _: &Alert, _: &DispatchReport, _: &[Recipient]) -> Vec<EscalationTarget> {
        Vec::new()
    }
}

pub fn policy_for(mode: EscalationMode) -> Arc<dyn EscalationPolicy> {
    match mode {
        EscalationMode::EmergencyFallback => Arc::new(EmergencyFallback),
        EscalationMode::None => Arc::new(NoEscalation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AlertKind, AlertLevel, ChannelDeliveryFailure, DeviceId, RecipientId};
    use crate::services::dispatcher::{DeliveryOutcome, RecipientOutcome};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn alert(level: AlertLevel) -> Alert {
        Alert {
            id: Uuid::now_v7(),
            device_id: DeviceId::new("d1"),
            facility_id: None,
            level,
            kind: AlertKind::Fall,
            message: "Fall detected".to_string(),
            detail: json!({}),
            created_at: Utc::now(),
        }
    }

    fn recipient(id: &str, emergency: Option<&str>) -> Recipient {
        let mut channel_addresses = BTreeMap::new();
        channel_addresses.insert(ChannelKind::PushMessage, format!("push-{id}"));
        if let Some(addr) = emergency {
            channel_addresses.insert(ChannelKind::EmergencyEscalation, addr.to_string());
        }
        Recipient { id: RecipientId::new(id), channel_addresses, facility_id: None }
    }

    fn outcome(id: &str, ok: bool) -> RecipientOutcome {
        RecipientOutcome {
            recipient_id: RecipientId::new(id),
            deliveries: vec![DeliveryOutcome {
                channel: ChannelKind::PushMessage,
                address: format!("push-{id}"),
                result: if ok { Ok(()) } else { Err(ChannelDeliveryFailure::RateLimited) },
                latency_us: 10,
            }],
        }
    }

    fn report(a: &Alert, outcomes: Vec<RecipientOutcome>) -> DispatchReport {
        DispatchReport { alert_id: Some(a.id), outcomes, registry_error: None }
    }

    #[test]
    fn test_fallback_targets_unreached_recipients() {
        let a = alert(AlertLevel::Emergency);
        let recipients =
            vec![recipient("r1", Some("+81-1")), recipient("r2", Some("+81-2")), recipient("r3", None)];
        let r = report(&a, vec![outcome("r1", true), outcome("r2", false), outcome("r3", false)]);

        let targets = EmergencyFallback.escalations(&a, &r, &recipients);
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].recipient_id, RecipientId::new("r2"));
        assert_eq!(targets[0].address, "+81-2");
    }

    #[test]
    fn test_fallback_ignores_non_emergency() {
        let a = alert(AlertLevel::Warning);
        let recipients = vec![recipient("r1", Some("+81-1"))];
        let r = report(&a, vec![outcome("r1", false)]);
        assert!(EmergencyFallback.escalations(&a, &r, &recipients).is_empty());
    }

    #[test]
    fn test_no_escalation_policy() {
        let a = alert(AlertLevel::Emergency);
        let recipients = vec![recipient("r1", Some("+81-1"))];
        let r = report(&a, vec![outcome("r1", false)]);
        assert!(policy_for(EscalationMode::None).escalations(&a, &r, &recipients).is_empty());
    }
}
