//! Strategy selector
//!
//! Maps a number to the ordered list of providers to try. The routing table is
//! plain data (loaded from configuration); [`StrategySelector::select`] is a
//! pure function of the number, the forced provider and that table.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::{PhoneNumber, Provider};

/// Routes numbers whose digits start with `prefix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Leading digits without `+`, e.g. `79`
    pub prefix: String,
    /// Providers in the order they should be tried
    pub providers: Vec<Provider>,
}

impl RouteRule {
    pub fn new(prefix: impl Into<String>, providers: Vec<Provider>) -> Self {
        Self {
            prefix: prefix.into(),
            providers,
        }
    }
}

/// Prefix routing table with a fallback list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    pub default: Vec<Provider>,
}

impl Default for RoutingTable {
    /// Russian mobile numbers go to the domestic specialists first
    fn default() -> Self {
        Self {
            rules: vec![RouteRule::new(
                "79",
                vec![Provider::Kaspersky, Provider::GetContact],
            )],
            default: vec![Provider::Truecaller, Provider::GetContact],
        }
    }
}

impl RoutingTable {
    /// Reject tables that could route a number nowhere or ambiguously
    pub fn validate(&self) -> Result<()> {
        check_provider_list("default route", &self.default)?;

        let mut prefixes = HashSet::new();
        for rule in &self.rules {
            if rule.prefix.is_empty() || !rule.prefix.chars().all(|c| c.is_ascii_digit()) {
                return Err(Error::config(format!(
                    "route prefix '{}' must be non-empty digits",
                    rule.prefix
                )));
            }
            if !prefixes.insert(rule.prefix.as_str()) {
                return Err(Error::config(format!("duplicate route prefix '{}'", rule.prefix)));
            }
            check_provider_list(&format!("route '{}'", rule.prefix), &rule.providers)?;
        }
        Ok(())
    }

    /// Every provider the table can return
    pub fn providers(&self) -> HashSet<Provider> {
        self.rules
            .iter()
            .flat_map(|r| r.providers.iter().copied())
            .chain(self.default.iter().copied())
            .collect()
    }

    /// Providers for `number`: the longest matching prefix wins
    pub fn route(&self, number: &PhoneNumber) -> &[Provider] {
        let digits = number.digits();
        self.rules
            .iter()
            .filter(|r| digits.starts_with(r.prefix.as_str()))
            .max_by_key(|r| r.prefix.len())
            .map(|r| r.providers.as_slice())
            .unwrap_or(&self.default)
    }
}

fn check_provider_list(name: &str, providers: &[Provider]) -> Result<()> {
    if providers.is_empty() {
        return Err(Error::config(format!("{name} has no providers")));
    }
    let mut seen = HashSet::new();
    for provider in providers {
        if !seen.insert(provider) {
            return Err(Error::config(format!("{name} lists {provider} twice")));
        }
    }
    Ok(())
}

/// Produces the candidate provider order for a number
#[derive(Debug, Clone)]
pub struct StrategySelector {
    table: RoutingTable,
}

impl StrategySelector {
    /// Build a selector; the table must pass validation
    pub fn new(table: RoutingTable) -> Result<Self> {
        table.validate()?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Ordered providers to attempt.
    ///
    /// A forced provider short-circuits routing.
    pub fn select(&self, number: &PhoneNumber, forced_provider: Option<Provider>) -> Vec<Provider> {
        match forced_provider {
            Some(provider) => vec![provider],
            None => self.table.route(number).to_vec(),
        }
    }
}
