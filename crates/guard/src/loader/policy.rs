//! Declarative policy modules.
//!
//! A policy module is a JSON rule document. It can only be built from a
//! [`VerifiedModule`], so rules are never parsed from bytes that have not
//! passed the digest check.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::Deserialize;

use super::VerifiedModule;
use crate::errors::GuardError;
use crate::types::{TelemetrySnapshot, TripReason, Violation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMetric {
    DrawdownPct,
    Leverage,
    /// Absolute per-symbol exposure. Without `symbol`, applies to every position.
    Exposure,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    pub id: String,
    pub metric: PolicyMetric,
    #[serde(default)]
    pub symbol: Option<String>,
    pub max: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
    rules: Vec<PolicyRule>,
}

/// Parsed rules of one verified module.
#[derive(Debug, Clone)]
pub struct PolicyModule {
    name: String,
    digest: String,
    rules: Vec<PolicyRule>,
}

impl PolicyModule {
    pub fn from_verified(module: &VerifiedModule) -> Result<Self, GuardError> {
        let malformed = |reason: String| GuardError::Policy {
            module: module.name().to_string(),
            reason,
        };

        let doc: PolicyDocument =
            serde_json::from_slice(module.as_bytes()).map_err(|e| malformed(e.to_string()))?;

        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for rule in &doc.rules {
            if rule.id.trim().is_empty() {
                errors.push("rule id must not be empty".to_string());
            } else if !seen.insert(rule.id.as_str()) {
                errors.push(format!("duplicate rule id '{}'", rule.id));
            }
            if rule.max < Decimal::ZERO {
                errors.push(format!("rule '{}': max must be >= 0", rule.id));
            }
            if rule.symbol.is_some() && rule.metric != PolicyMetric::Exposure {
                errors.push(format!(
                    "rule '{}': symbol is only valid for exposure rules",
                    rule.id
                ));
            }
        }
        if !errors.is_empty() {
            return Err(malformed(errors.join("; ")));
        }

        Ok(Self {
            name: module.name().to_string(),
            digest: module.digest().to_string(),
            rules: doc.rules,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// First violated rule, in document order.
    pub fn evaluate(&self, snapshot: &TelemetrySnapshot) -> Option<Violation> {
        self.rules.iter().find_map(|rule| self.check_rule(rule, snapshot))
    }

    fn check_rule(&self, rule: &PolicyRule, snapshot: &TelemetrySnapshot) -> Option<Violation> {
        let observed = match (rule.metric, rule.symbol.as_deref()) {
            (PolicyMetric::DrawdownPct, _) => Some(snapshot.drawdown_pct),
            (PolicyMetric::Leverage, _) => Some(snapshot.leverage),
            (PolicyMetric::Exposure, Some(symbol)) => {
                snapshot.positions.get(symbol).map(|e| e.abs())
            }
            (PolicyMetric::Exposure, None) => snapshot
                .positions
                .values()
                .map(|e| e.abs())
                .find(|e| *e > rule.max),
        }?;

        (observed > rule.max).then(|| Violation {
            reason: TripReason::Policy {
                module: self.name.clone(),
                rule: rule.id.clone(),
            },
            observed,
            limit: rule.max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn module(json: &str) -> Result<PolicyModule, GuardError> {
        let verified = VerifiedModule::for_tests("desk_caps", json.as_bytes());
        PolicyModule::from_verified(&verified)
    }

    fn snapshot(drawdown: Decimal, leverage: Decimal, positions: &[(&str, Decimal)]) -> TelemetrySnapshot {
        TelemetrySnapshot {
            drawdown_pct: drawdown,
            leverage,
            positions: positions
                .iter()
                .map(|(s, e)| (s.to_string(), *e))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_first_violated_rule_wins() {
        let m = module(
            r#"{ "rules": [
                { "id": "lev", "metric": "leverage", "max": 3 },
                { "id": "dd", "metric": "drawdown_pct", "max": 2 }
            ] }"#,
        )
        .unwrap();
        let v = m.evaluate(&snapshot(dec!(5), dec!(4), &[])).unwrap();
        assert_eq!(v.reason.to_string(), "policy:desk_caps/lev");
        assert_eq!(v.observed, dec!(4));
        assert_eq!(v.limit, dec!(3));
    }

    #[test]
    fn test_symbol_exposure_uses_absolute_value() {
        let m = module(
            r#"{ "rules": [ { "id": "eth_cap", "metric": "exposure", "symbol": "ETH", "max": 1.5 } ] }"#,
        )
        .unwrap();
        assert!(m.evaluate(&snapshot(dec!(0), dec!(0), &[("ETH", dec!(-1.4))])).is_none());
        let v = m
            .evaluate(&snapshot(dec!(0), dec!(0), &[("ETH", dec!(-1.6))]))
            .unwrap();
        assert_eq!(v.observed, dec!(1.6));
    }

    #[test]
    fn test_unscoped_exposure_rule_checks_every_symbol() {
        let m = module(r#"{ "rules": [ { "id": "any", "metric": "exposure", "max": 2 } ] }"#).unwrap();
        let v = m
            .evaluate(&snapshot(dec!(0), dec!(0), &[("ADA", dec!(1)), ("SOL", dec!(2.5))]))
            .unwrap();
        assert_eq!(v.observed, dec!(2.5));
    }

    #[test]
    fn test_absent_symbol_is_not_a_violation() {
        let m = module(
            r#"{ "rules": [ { "id": "eth_cap", "metric": "exposure", "symbol": "ETH", "max": 1 } ] }"#,
        )
        .unwrap();
        assert!(m.evaluate(&snapshot(dec!(0), dec!(0), &[])).is_none());
    }

    #[test]
    fn test_malformed_rules_reported_together() {
        let err = module(
            r#"{ "rules": [
                { "id": "a", "metric": "leverage", "symbol": "BTC", "max": -1 },
                { "id": "a", "metric": "leverage", "max": 1 }
            ] }"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("max must be >= 0"));
        assert!(msg.contains("symbol is only valid for exposure rules"));
        assert!(msg.contains("duplicate rule id 'a'"));
    }

    #[test]
    fn test_unknown_metric_rejected() {
        assert!(matches!(
            module(r#"{ "rules": [ { "id": "x", "metric": "vibes", "max": 1 } ] }"#),
            Err(GuardError::Policy { .. })
        ));
    }
}
