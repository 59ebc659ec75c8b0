//! Rules that hide updates from the upgradable listing and block automatic
//! updates.
//!
//! Keys are `manager\packageId` with the manager lowercased. Values are `*`
//! (every version), `<YYYY-MM-DD` (every version until that date) or a literal
//! version. Date rules are not swept in the background; a rule whose date has
//! passed is removed the next time it is read.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tracing::{debug, info};

use crate::data::constants::{IGNORED_UPDATES_STORE, IGNORE_KEY_SEPARATOR};
use crate::stores::{PersistedMap, StoreBackend};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IgnoreRule {
    AllVersions,
    /// One exact version string; no range semantics.
    Version(String),
    /// Every version until the given date, exclusive.
    Until(NaiveDate),
}

impl IgnoreRule {
    #[must_use]
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        matches!(self, IgnoreRule::Until(date) if today >= *date)
    }

    #[must_use]
    pub fn matches(&self, candidate_version: &str, today: NaiveDate) -> bool {
        match self {
            IgnoreRule::AllVersions => true,
            IgnoreRule::Version(version) => version == candidate_version,
            IgnoreRule::Until(_) => !self.is_expired(today),
        }
    }
}

impl FromStr for IgnoreRule {
    type Err = std::convert::Infallible;

    /// Never fails: anything that is neither `*` nor a valid `<date` is a
    /// literal version.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "*" {
            return Ok(IgnoreRule::AllVersions);
        }
        if let Some(date) = value.strip_prefix('<') {
            if let Ok(date) = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d") {
                return Ok(IgnoreRule::Until(date));
            }
        }
        Ok(IgnoreRule::Version(value.to_string()))
    }
}

impl fmt::Display for IgnoreRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreRule::AllVersions => f.write_str("*"),
            IgnoreRule::Version(version) => f.write_str(version),
            IgnoreRule::Until(date) => write!(f, "<{}", date.format("%Y-%m-%d")),
        }
    }
}

fn rule_key(manager: &str, package_id: &str) -> String {
    format!("{}{}{}", manager.to_lowercase(), IGNORE_KEY_SEPARATOR, package_id)
}

/// The ignored-updates store.
#[derive(Debug)]
pub struct IgnoredUpdatesDatabase {
    rules: PersistedMap,
}

impl IgnoredUpdatesDatabase {
    pub fn load(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            rules: PersistedMap::load(IGNORED_UPDATES_STORE, backend),
        }
    }

    pub fn add(&self, manager: &str, package_id: &str, rule: IgnoreRule) {
        let key = rule_key(manager, package_id);
        info!(%key, %rule, "Ignoring updates");
        self.rules.insert(key, rule.to_string());
    }

    pub fn remove(&self, manager: &str, package_id: &str) -> bool {
        let key = rule_key(manager, package_id);
        let removed = self.rules.remove(&key);
        if removed {
            info!(%key, "Stopped ignoring updates");
        }
        removed
    }

    /// The live rule for a package, as of today.
    pub fn rule(&self, manager: &str, package_id: &str) -> Option<IgnoreRule> {
        self.rule_on(manager, package_id, Local::now().date_naive())
    }

    pub fn rule_on(&self, manager: &str, package_id: &str, today: NaiveDate) -> Option<IgnoreRule> {
        let key = rule_key(manager, package_id);
        let raw = self.rules.get(&key)?;
        let rule = match raw.parse::<IgnoreRule>() {
            Ok(rule) => rule,
            Err(never) => match never {},
        };
        if rule.is_expired(today) {
            // A concurrent `add` may have replaced the rule since it was read.
            if self.rules.remove_if_eq(&key, &raw) {
                info!(%key, %rule, "Ignore rule expired");
            }
            return None;
        }
        Some(rule)
    }

    pub fn is_ignored(&self, manager: &str, package_id: &str, candidate_version: &str) -> bool {
        self.is_ignored_on(manager, package_id, candidate_version, Local::now().date_naive())
    }

    pub fn is_ignored_on(
        &self,
        manager: &str,
        package_id: &str,
        candidate_version: &str,
        today: NaiveDate,
    ) -> bool {
        let ignored = self
            .rule_on(manager, package_id, today)
            .is_some_and(|rule| rule.matches(candidate_version, today));
        if ignored {
            debug!(manager, package_id, candidate_version, "Update is ignored");
        }
        ignored
    }

    /// Every stored rule as `(manager, package id, rule)`, expired ones included.
    pub fn rules(&self) -> Vec<(String, String, IgnoreRule)> {
        self.rules
            .snapshot()
            .into_iter()
            .filter_map(|(key, value)| {
                let (manager, id) = key.split_once(IGNORE_KEY_SEPARATOR)?;
                let rule = value.parse().ok()?;
                Some((manager.to_string(), id.to_string(), rule))
            })
            .collect()
    }
}
