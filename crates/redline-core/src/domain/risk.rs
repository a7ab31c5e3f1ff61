//! Risk tiers carried by intents, planned commands and execution requests.

use serde::{Deserialize, Serialize};

/// Risk tier assigned by the upstream assessment.
///
/// Ordering is significant: the planner aggregates command risks with `max`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// Informational, never gates execution.
    #[default]
    Low,
    /// Moderate, recorded in the review stub but not gated.
    Medium,
    /// Always requires an explicit human approval.
    High,
    /// Always requires an explicit human approval.
    Critical,
}

impl RiskTier {
    /// Whether this tier requires a review record before apply.
    pub fn requires_approval(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_tier_ordering() {
        assert!(RiskTier::Low < RiskTier::Medium);
        assert!(RiskTier::Medium < RiskTier::High);
        assert!(RiskTier::High < RiskTier::Critical);
    }

    #[test]
    fn test_requires_approval() {
        assert!(!RiskTier::Low.requires_approval());
        assert!(!RiskTier::Medium.requires_approval());
        assert!(RiskTier::High.requires_approval());
        assert!(RiskTier::Critical.requires_approval());
    }

    #[test]
    fn test_deserializes_lowercase_names() {
        let tier: RiskTier = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(tier, RiskTier::High);
        assert!(serde_json::from_str::<RiskTier>("\"HIGH\"").is_err());
    }
}
