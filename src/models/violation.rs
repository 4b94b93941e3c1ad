use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::rule::RuleType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Warning,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Warning => "warning",
            Severity::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "warning" => Some(Severity::Warning),
            "high" => Some(Severity::High),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of a single detector firing, before it is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationResult {
    pub rule_id: Uuid,
    pub rule_type: RuleType,
    pub severity: Severity,
    /// Detector-specific evidence
    pub data: serde_json::Value,
}

/// A stored violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub rule_type: RuleType,
    pub server_user_id: String,
    pub session_id: Uuid,
    pub severity: Severity,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Violation {
    pub fn from_result(
        result: ViolationResult,
        server_user_id: &str,
        session_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Self {
        Violation {
            id: Uuid::new_v4(),
            rule_id: result.rule_id,
            rule_type: result.rule_type,
            server_user_id: server_user_id.to_string(),
            session_id,
            severity: result.severity,
            data: result.data,
            created_at,
            acknowledged_at: None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Warning);
        assert!(Severity::Warning > Severity::Low);
        assert_eq!(Severity::parse("warning"), Some(Severity::Warning));
        assert_eq!(Severity::parse("critical"), None);
    }
}
