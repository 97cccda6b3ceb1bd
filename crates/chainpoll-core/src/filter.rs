//! Consumer-declared log filters and the per-chain registry that unions them.
//!
//! Every registered [`Filter`] names a set of contract addresses and event
//! signatures. The poll loop takes a [`FilterSet`] snapshot once per tick, so
//! a registration made mid-tick only takes effect on the next tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PollerError;
use crate::types::{is_zero_hex, normalize_hex, Log};

// ─── Filter ───────────────────────────────────────────────────────────────────

/// A named (addresses × event signatures) filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Unique name; see [`filter_name`].
    pub name: String,
    pub addresses: Vec<String>,
    /// Accepted values for `topics[0]`.
    pub event_sigs: Vec<String>,
    /// Accepted values for `topics[1]` (empty = any).
    #[serde(default)]
    pub topic2: Vec<String>,
    /// Accepted values for `topics[2]` (empty = any).
    #[serde(default)]
    pub topic3: Vec<String>,
    /// Accepted values for `topics[3]` (empty = any).
    #[serde(default)]
    pub topic4: Vec<String>,
    /// Maximum age of matching logs; `None` keeps them forever.
    #[serde(default)]
    pub retention: Option<Duration>,
    /// Newest finalized matching logs to keep; 0 keeps all.
    #[serde(default)]
    pub max_logs_kept: u64,
}

impl Filter {
    pub fn new<A, S>(name: impl Into<String>, addresses: A, event_sigs: S) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            name: name.into(),
            addresses: addresses.into_iter().map(Into::into).collect(),
            event_sigs: event_sigs.into_iter().map(Into::into).collect(),
            topic2: vec![],
            topic3: vec![],
            topic4: vec![],
            retention: None,
            max_logs_kept: 0,
        }
    }

    /// Restrict an indexed topic position (1..=3) to the given values.
    pub fn with_topic<I>(mut self, index: usize, values: I) -> Result<Self, PollerError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        match index {
            1 => self.topic2 = values,
            2 => self.topic3 = values,
            3 => self.topic4 = values,
            other => {
                return Err(PollerError::InvalidFilter(format!(
                    "topic index {other} out of range 1..=3"
                )))
            }
        }
        Ok(self)
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_max_logs_kept(mut self, max_logs_kept: u64) -> Self {
        self.max_logs_kept = max_logs_kept;
        self
    }

    /// Validate the filter and return it in canonical form: lowercase hex,
    /// sorted and de-duplicated value sets.
    pub fn normalized(mut self) -> Result<Self, PollerError> {
        if self.name.trim().is_empty() {
            return Err(PollerError::InvalidFilter("filter name must not be empty".into()));
        }
        if self.addresses.is_empty() {
            return Err(PollerError::InvalidFilter(format!(
                "filter '{}': at least one address must be specified",
                self.name
            )));
        }
        if self.event_sigs.is_empty() {
            return Err(PollerError::InvalidFilter(format!(
                "filter '{}': at least one event signature must be specified",
                self.name
            )));
        }
        if self.addresses.iter().any(|a| is_zero_hex(a)) {
            return Err(PollerError::InvalidFilter(format!("filter '{}': empty address", self.name)));
        }
        if self.event_sigs.iter().any(|s| is_zero_hex(s)) {
            return Err(PollerError::InvalidFilter(format!(
                "filter '{}': empty event signature",
                self.name
            )));
        }

        self.addresses = canonical(self.addresses);
        self.event_sigs = canonical(self.event_sigs);
        self.topic2 = canonical(self.topic2);
        self.topic3 = canonical(self.topic3);
        self.topic4 = canonical(self.topic4);
        Ok(self)
    }

    /// Returns `true` if every log `other` matches is also matched by `self`.
    /// Both filters must be normalized.
    pub fn contains(&self, other: &Filter) -> bool {
        subset(&other.addresses, &self.addresses)
            && subset(&other.event_sigs, &self.event_sigs)
            && topic_subset(&other.topic2, &self.topic2)
            && topic_subset(&other.topic3, &self.topic3)
            && topic_subset(&other.topic4, &self.topic4)
            && self.retention == other.retention
            && self.max_logs_kept == other.max_logs_kept
    }

    /// Returns `true` if `log` matches this (normalized) filter.
    pub fn matches(&self, log: &Log) -> bool {
        self.addresses.binary_search(&log.address).is_ok()
            && self.event_sigs.binary_search(&log.event_sig).is_ok()
            && topic_matches(&self.topic2, log.topic(1))
            && topic_matches(&self.topic3, log.topic(2))
            && topic_matches(&self.topic4, log.topic(3))
    }
}

/// Builds a conventional unique filter name: `id`, or `id - a:b:c`.
pub fn filter_name(id: &str, args: &[&dyn std::fmt::Display]) -> String {
    let mut name = id.to_string();
    for (i, arg) in args.iter().enumerate() {
        name.push_str(if i == 0 { " - " } else { ":" });
        name.push_str(&arg.to_string());
    }
    name
}

fn canonical(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(normalize_hex)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn subset(inner: &[String], outer: &[String]) -> bool {
    inner.iter().all(|v| outer.binary_search(v).is_ok())
}

fn topic_subset(inner: &[String], outer: &[String]) -> bool {
    // An empty outer set is a wildcard; an empty inner set is only contained
    // by another wildcard.
    outer.is_empty() || (!inner.is_empty() && subset(inner, outer))
}

fn topic_matches(accepted: &[String], topic: Option<&str>) -> bool {
    if accepted.is_empty() {
        return true;
    }
    match topic {
        Some(t) => accepted.iter().any(|a| a == t),
        None => false,
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Outcome of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    /// An existing filter with the same name was widened or changed.
    Replaced,
    /// The existing filter already covers the new one; nothing changed.
    Unchanged,
}

/// The locked, per-chain set of registered filters.
///
/// Writers are consumer registration calls; the poll loop reads a snapshot
/// once per tick.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    filters: RwLock<HashMap<String, Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Filter>> {
        self.filters.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Filter>> {
        self.filters.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// What [`insert`](Self::insert) would do with a normalized filter.
    pub fn plan(&self, filter: &Filter) -> Registration {
        match self.read().get(&filter.name) {
            Some(existing) if existing.contains(filter) => Registration::Unchanged,
            Some(_) => Registration::Replaced,
            None => Registration::Inserted,
        }
    }

    /// Insert or replace a normalized filter.
    pub fn insert(&self, filter: Filter) -> Registration {
        let mut filters = self.write();
        match filters.get(&filter.name) {
            Some(existing) if existing.contains(&filter) => Registration::Unchanged,
            Some(_) => {
                filters.insert(filter.name.clone(), filter);
                Registration::Replaced
            }
            None => {
                filters.insert(filter.name.clone(), filter);
                Registration::Inserted
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Filter> {
        self.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Filter> {
        self.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the current filters, taken at a tick boundary.
    pub fn snapshot(&self) -> FilterSet {
        let mut filters: Vec<Filter> = self.read().values().cloned().collect();
        filters.sort_by(|a, b| a.name.cmp(&b.name));
        FilterSet { filters }
    }
}

// ─── FilterSet ────────────────────────────────────────────────────────────────

/// Immutable snapshot of the registry.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<Filter>,
}

/// Logs with this address and event signature expire after `max_age`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionRule {
    pub address: String,
    pub event_sig: String,
    pub max_age: Duration,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter()
    }

    pub fn as_slice(&self) -> &[Filter] {
        &self.filters
    }

    /// Returns `true` if any filter caps its number of kept logs.
    pub fn has_log_caps(&self) -> bool {
        self.filters.iter().any(|f| f.max_logs_kept > 0)
    }

    /// Union of all addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        self.filters
            .iter()
            .flat_map(|f| f.addresses.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Union of all event signatures, sorted.
    pub fn event_sigs(&self) -> Vec<String> {
        self.filters
            .iter()
            .flat_map(|f| f.event_sigs.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns `true` if any filter matches `log`.
    pub fn matches(&self, log: &Log) -> bool {
        self.filters.iter().any(|f| f.matches(log))
    }

    /// Expiry rules per (address, event signature) pair. A pair is kept
    /// forever if any filter covering it has no retention; otherwise the
    /// longest retention wins.
    pub fn retention_rules(&self) -> Vec<RetentionRule> {
        let mut pairs: BTreeMap<(String, String), Option<Duration>> = BTreeMap::new();
        for filter in &self.filters {
            for address in &filter.addresses {
                for sig in &filter.event_sigs {
                    let key = (address.clone(), sig.clone());
                    let merged = match (pairs.get(&key), filter.retention) {
                        (None, r) => r,
                        (Some(None), _) | (_, None) => None,
                        (Some(Some(a)), Some(b)) => Some((*a).max(b)),
                    };
                    pairs.insert(key, merged);
                }
            }
        }
        pairs
            .into_iter()
            .filter_map(|((address, event_sig), retention)| {
                retention.map(|max_age| RetentionRule { address, event_sig, max_age })
            })
            .collect()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
