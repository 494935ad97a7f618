use thiserror::Error;

/// Creation-error phrases that mean the advertised offer no longer exists on
/// the provider side. Matched case-insensitively.
const STALE_INVENTORY_PHRASES: &[&str] = &[
    "no available nodes",
    "insufficient capacity",
    "out of stock",
    "resource unavailable",
];

/// Uniform error taxonomy over every provider's raw HTTP failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} {operation}: rate limited: {message}")]
    RateLimited {
        provider: String,
        operation: String,
        message: String,
    },

    #[error("{provider} {operation}: authentication failed ({status}): {message}")]
    Auth {
        provider: String,
        operation: String,
        status: u16,
        message: String,
    },

    #[error("{provider} {operation}: not found: {message}")]
    NotFound {
        provider: String,
        operation: String,
        message: String,
    },

    /// 5xx-class failure, or a transport failure (`status` 0 = no HTTP
    /// response). Retryable.
    #[error("{provider} {operation}: server error ({status}): {message}")]
    Server {
        provider: String,
        operation: String,
        status: u16,
        message: String,
    },

    /// The provider advertised an offer it cannot actually fill. Signals the
    /// lifecycle engine to fail over to a different offer.
    #[error("{provider} {operation}: stale inventory: {message}")]
    StaleInventory {
        provider: String,
        operation: String,
        message: String,
    },

    #[error("{provider}: offer unavailable: {offer}")]
    OfferUnavailable { provider: String, offer: String },

    #[error("{provider}: template not found: {template}")]
    TemplateNotFound { provider: String, template: String },

    #[error("{provider} {operation}: invalid response: {message}")]
    InvalidResponse {
        provider: String,
        operation: String,
        message: String,
    },

    #[error("{provider} {operation}: {message}")]
    Provider {
        provider: String,
        operation: String,
        message: String,
    },

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Map an HTTP status code onto the taxonomy.
    pub fn from_status(
        provider: &str,
        operation: &str,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        let provider = provider.to_string();
        let operation = operation.to_string();
        let message = message.into();
        match status {
            429 => ProviderError::RateLimited { provider, operation, message },
            401 | 403 => ProviderError::Auth { provider, operation, status, message },
            404 => ProviderError::NotFound { provider, operation, message },
            s if s >= 500 => ProviderError::Server { provider, operation, status, message },
            _ => ProviderError::Provider { provider, operation, message },
        }
    }

    /// Like [`from_status`](Self::from_status) but additionally recognizes the
    /// capacity/availability phrases providers use when their inventory has
    /// gone stale between listing and create.
    pub fn map_create_error(
        provider: &str,
        operation: &str,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if STALE_INVENTORY_PHRASES.iter().any(|p| lower.contains(p)) {
            return ProviderError::StaleInventory {
                provider: provider.to_string(),
                operation: operation.to_string(),
                message,
            };
        }
        Self::from_status(provider, operation, status, message)
    }

    /// Wrap a reqwest transport failure (connect/timeout/decode before any
    /// HTTP status was seen). Retryable like a 5xx.
    pub fn transport(provider: &str, operation: &str, err: reqwest::Error) -> Self {
        ProviderError::Server {
            provider: provider.to_string(),
            operation: operation.to_string(),
            status: 0,
            message: err.to_string(),
        }
    }

    pub fn invalid_response(provider: &str, operation: &str, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            provider: provider.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    // ── Classification predicates ─────────────────────────────────────────────

    /// Transient failures worth retrying against the same offer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Server { .. } | ProviderError::RateLimited { .. }
        )
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }

    pub fn is_stale_inventory(&self) -> bool {
        matches!(self, ProviderError::StaleInventory { .. })
    }

    pub fn is_offer_unavailable(&self) -> bool {
        matches!(self, ProviderError::OfferUnavailable { .. })
    }

    /// Failures that should trigger auto-retry failover onto a different
    /// offer rather than a local retry.
    pub fn triggers_failover(&self) -> bool {
        self.is_stale_inventory() || self.is_offer_unavailable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(ProviderError::from_status("p", "op", 429, "slow down").is_rate_limit());
        assert!(ProviderError::from_status("p", "op", 401, "bad key").is_auth());
        assert!(ProviderError::from_status("p", "op", 403, "forbidden").is_auth());
        assert!(ProviderError::from_status("p", "op", 404, "gone").is_not_found());
        assert!(ProviderError::from_status("p", "op", 503, "busy").is_retryable());
        assert!(!ProviderError::from_status("p", "op", 400, "bad").is_retryable());
    }

    #[test]
    fn create_errors_detect_stale_inventory_case_insensitively() {
        for msg in [
            "No available nodes for this configuration",
            "INSUFFICIENT CAPACITY in region",
            "offer is out of stock",
            "Resource Unavailable",
        ] {
            let err = ProviderError::map_create_error("p", "create", 400, msg);
            assert!(err.is_stale_inventory(), "{msg} should map to stale inventory");
            assert!(err.triggers_failover());
        }
    }

    #[test]
    fn non_stale_create_errors_fall_through_to_status_mapping() {
        let err = ProviderError::map_create_error("p", "create", 500, "boom");
        assert!(err.is_retryable());
        assert!(!err.is_stale_inventory());
    }

    #[test]
    fn transport_errors_are_retryable() {
        // Exercised indirectly: status 0 takes the Server arm.
        let err = ProviderError::Server {
            provider: "p".into(),
            operation: "list".into(),
            status: 0,
            message: "connection refused".into(),
        };
        assert!(err.is_retryable());
    }
}
