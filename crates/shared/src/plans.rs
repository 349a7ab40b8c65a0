//! Plan configuration.
//!
//! A plan maps a code (e.g. `"1m"`) to a price and an entitlement duration in
//! days. The table is built once at startup and handed to every component as
//! an immutable value; business logic never reads plan data from the
//! environment directly.
//!
//! Entitlement duration is always a pure function of the plan code. A payment
//! amount that disagrees with the configured price is logged and accepted
//! (providers round differently), but it never changes the entitled duration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A single purchasable tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub code: String,
    pub title: String,
    /// Price in the provider's smallest unit (minor units or stars).
    pub price: i64,
    pub duration_days: i64,
    pub is_subscription: bool,
}

/// Immutable plan table plus the referral bonus setting.
#[derive(Debug, Clone)]
pub struct PlanTable {
    plans: HashMap<String, Plan>,
    pub referral_bonus_days: i64,
}

/// Raised when a plan code is not configured.
#[derive(Debug, thiserror::Error)]
#[error("unknown plan: {0}")]
pub struct UnknownPlan(pub String);

impl PlanTable {
    pub fn new(plans: Vec<Plan>, referral_bonus_days: i64) -> Self {
        let plans = plans.into_iter().map(|p| (p.code.clone(), p)).collect();
        Self {
            plans,
            referral_bonus_days,
        }
    }

    /// Build the table from environment variables, falling back to the
    /// default tier set when a price is not overridden.
    pub fn from_env() -> Self {
        let price = |name: &str, default: i64| -> i64 {
            std::env::var(name)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(default)
        };

        let plans = vec![
            Plan {
                code: "test_1d".to_string(),
                title: "24h trial".to_string(),
                price: price("PLAN_PRICE_TRIAL", 1),
                duration_days: 1,
                is_subscription: false,
            },
            Plan {
                code: "1m".to_string(),
                title: "1 month".to_string(),
                price: price("PLAN_PRICE_MONTH", 300),
                duration_days: 30,
                is_subscription: false,
            },
            Plan {
                code: "3m".to_string(),
                title: "3 months".to_string(),
                price: price("PLAN_PRICE_3M", 800),
                duration_days: 90,
                is_subscription: false,
            },
            Plan {
                code: "1y".to_string(),
                title: "12 months".to_string(),
                price: price("PLAN_PRICE_YEAR", 2400),
                duration_days: 365,
                is_subscription: false,
            },
            Plan {
                code: "sub_1m".to_string(),
                title: "Monthly subscription".to_string(),
                price: price("PLAN_PRICE_MONTH", 300),
                duration_days: 30,
                is_subscription: true,
            },
        ];

        let bonus = price("REFERRAL_BONUS_DAYS", 7);
        Self::new(plans, bonus)
    }

    pub fn get(&self, code: &str) -> Result<&Plan, UnknownPlan> {
        self.plans.get(code).ok_or_else(|| UnknownPlan(code.to_string()))
    }

    /// Entitlement duration for a plan code. Pure function of the code.
    pub fn duration_days(&self, code: &str) -> Result<i64, UnknownPlan> {
        Ok(self.get(code)?.duration_days)
    }

    /// Resolve the effective amount for a payment. A caller-supplied amount
    /// that disagrees with the configured price is accepted but logged, so
    /// provider rounding differences never block a payment.
    pub fn resolve_amount(&self, code: &str, supplied: Option<i64>) -> Result<i64, UnknownPlan> {
        let expected = self.get(code)?.price;
        match supplied {
            None => Ok(expected),
            Some(actual) => {
                if actual != expected {
                    tracing::warn!(
                        plan = code,
                        expected = expected,
                        actual = actual,
                        "Payment amount disagrees with configured plan price"
                    );
                }
                Ok(actual)
            }
        }
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PlanTable {
        PlanTable::new(
            vec![
                Plan {
                    code: "1m".to_string(),
                    title: "1 month".to_string(),
                    price: 80,
                    duration_days: 30,
                    is_subscription: false,
                },
                Plan {
                    code: "3m".to_string(),
                    title: "3 months".to_string(),
                    price: 200,
                    duration_days: 90,
                    is_subscription: false,
                },
            ],
            7,
        )
    }

    #[test]
    fn unknown_plan_is_rejected() {
        let t = table();
        assert!(t.get("lifetime").is_err());
        assert!(t.duration_days("lifetime").is_err());
    }

    #[test]
    fn duration_is_a_function_of_plan_code_only() {
        let t = table();
        // A discounted amount must not shrink the entitlement.
        assert_eq!(t.resolve_amount("1m", Some(50)).unwrap(), 50);
        assert_eq!(t.duration_days("1m").unwrap(), 30);
    }

    #[test]
    fn missing_amount_falls_back_to_configured_price() {
        let t = table();
        assert_eq!(t.resolve_amount("3m", None).unwrap(), 200);
        assert_eq!(t.resolve_amount("3m", Some(200)).unwrap(), 200);
    }
}
