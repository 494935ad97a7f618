use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::types::SessionId;

/// Every instance this control plane creates carries a label with this prefix.
/// Reconciliation depends on the exact format `shopper-{sessionId}`.
pub const LABEL_PREFIX: &str = "shopper-";

const TAG_SESSION_ID: &str = "shopper-session-id";
const TAG_DEPLOYMENT_ID: &str = "shopper-deployment-id";
const TAG_CONSUMER_ID: &str = "shopper-consumer-id";
const TAG_EXPIRES_AT: &str = "shopper-expires-at";

/// Metadata stamped onto every provider instance we create.
///
/// Providers with a single free-form label carry only `to_label()`; providers
/// with key/value metadata carry the full `to_map()` set, which lets the
/// reconciler scope its view to one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTags {
    pub session_id: SessionId,
    /// Identity of the control-plane process that created the instance.
    /// Absent when the provider only supports the bare label.
    pub deployment_id: Option<String>,
    pub consumer_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl InstanceTags {
    pub fn new(
        session_id: SessionId,
        deployment_id: impl Into<String>,
        consumer_id: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            deployment_id: Some(deployment_id.into()),
            consumer_id: Some(consumer_id.into()),
            expires_at: Some(expires_at),
        }
    }

    /// The single-label encoding: `shopper-{sessionId}`.
    pub fn to_label(&self) -> String {
        format!("{}{}", LABEL_PREFIX, self.session_id)
    }

    /// Recover the session id from a `shopper-{sessionId}` label.
    pub fn parse_label(label: &str) -> Result<SessionId, DomainError> {
        match label.strip_prefix(LABEL_PREFIX) {
            Some(id) if !id.is_empty() => Ok(SessionId::new(id)),
            _ => Err(DomainError::InvalidLabel(label.to_string())),
        }
    }

    /// Full key/value encoding for providers with rich metadata.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(TAG_SESSION_ID.to_string(), self.session_id.to_string());
        if let Some(d) = &self.deployment_id {
            map.insert(TAG_DEPLOYMENT_ID.to_string(), d.clone());
        }
        if let Some(c) = &self.consumer_id {
            map.insert(TAG_CONSUMER_ID.to_string(), c.clone());
        }
        if let Some(e) = &self.expires_at {
            map.insert(TAG_EXPIRES_AT.to_string(), e.to_rfc3339());
        }
        map
    }

    /// Parse a tag map produced by `to_map`. Returns None when the session-id
    /// key is missing (not one of ours).
    pub fn from_map(map: &HashMap<String, String>) -> Option<Self> {
        let session_id = SessionId::new(map.get(TAG_SESSION_ID)?.clone());
        let expires_at = map
            .get(TAG_EXPIRES_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        Some(Self {
            session_id,
            deployment_id: map.get(TAG_DEPLOYMENT_ID).cloned(),
            consumer_id: map.get(TAG_CONSUMER_ID).cloned(),
            expires_at,
        })
    }

    /// Label-only fallback: everything except the session id is unknown.
    pub fn from_label(label: &str) -> Result<Self, DomainError> {
        Ok(Self {
            session_id: Self::parse_label(label)?,
            deployment_id: None,
            consumer_id: None,
            expires_at: None,
        })
    }
}

/// Observed state of one instance enumerated from a provider. A read-only
/// snapshot; adapters never hand out shared mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub id: String,
    pub label: String,
    /// Raw provider status string, e.g. "running", "exited".
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    /// Tags parsed from the label or metadata map; None when the instance
    /// does not carry the shopper prefix at all.
    pub tags: Option<InstanceTags>,
    pub price_per_hour: Option<f64>,
}

impl ProviderInstance {
    /// Whether this instance belongs to the given deployment.
    ///
    /// Label-only providers cannot record a deployment id; their instances
    /// count as ours as long as the shopper label parses.
    pub fn is_ours(&self, deployment_id: &str) -> bool {
        match &self.tags {
            Some(tags) => match &tags.deployment_id {
                Some(d) => d == deployment_id,
                None => true,
            },
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.tags
            .as_ref()
            .and_then(|t| t.expires_at)
            .map(|e| e < now)
            .unwrap_or(false)
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.tags.as_ref().map(|t| &t.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn label_round_trips_for_all_non_empty_ids() {
        for id in ["s1", "abc-def", "9f8e7d6c"] {
            let tags = InstanceTags::new(SessionId::new(id), "dep", "con", Utc::now());
            assert_eq!(
                InstanceTags::parse_label(&tags.to_label()).unwrap(),
                SessionId::new(id)
            );
        }
    }

    #[test]
    fn parse_label_rejects_foreign_and_empty_labels() {
        assert!(InstanceTags::parse_label("other-s1").is_err());
        assert!(InstanceTags::parse_label("shopper-").is_err());
        assert!(InstanceTags::parse_label("").is_err());
    }

    #[test]
    fn tag_map_round_trips() {
        let tags = InstanceTags::new(SessionId::new("s1"), "dep-1", "con-1", Utc::now());
        let back = InstanceTags::from_map(&tags.to_map()).unwrap();
        assert_eq!(back.session_id, tags.session_id);
        assert_eq!(back.deployment_id.as_deref(), Some("dep-1"));
        assert_eq!(back.consumer_id.as_deref(), Some("con-1"));
        assert!(back.expires_at.is_some());
    }

    #[test]
    fn ownership_respects_deployment_id() {
        let instance = |dep: Option<&str>| ProviderInstance {
            id: "i1".to_string(),
            label: "shopper-s1".to_string(),
            status: "running".to_string(),
            started_at: None,
            tags: Some(InstanceTags {
                session_id: SessionId::new("s1"),
                deployment_id: dep.map(String::from),
                consumer_id: None,
                expires_at: None,
            }),
            price_per_hour: None,
        };

        assert!(instance(Some("dep-a")).is_ours("dep-a"));
        assert!(!instance(Some("dep-b")).is_ours("dep-a"));
        // Label-only providers: ours as long as the label parsed.
        assert!(instance(None).is_ours("dep-a"));
    }

    #[test]
    fn untagged_instances_are_never_ours() {
        let inst = ProviderInstance {
            id: "i2".to_string(),
            label: "someone-elses-vm".to_string(),
            status: "running".to_string(),
            started_at: None,
            tags: None,
            price_per_hour: None,
        };
        assert!(!inst.is_ours("dep-a"));
    }

    #[test]
    fn expiry_uses_tagged_deadline() {
        let mut tags = InstanceTags::new(SessionId::new("s1"), "d", "c", Utc::now());
        tags.expires_at = Some(Utc::now() - Duration::hours(1));
        let inst = ProviderInstance {
            id: "i1".to_string(),
            label: tags.to_label(),
            status: "running".to_string(),
            started_at: None,
            tags: Some(tags),
            price_per_hour: None,
        };
        assert!(inst.is_expired(Utc::now()));
    }
}
