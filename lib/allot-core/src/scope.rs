//! Scope keys.
//!
//! A [`ScopeKey`] names the organizational scope a quota row applies to: the whole system, a domain, a project, or
//! a project narrowed down to a cloud provider, region or zone. Every key belongs to a [`KeyLayer`], which fixes
//! its ordered field list. Layers extend one another: a zone key carries every field of a region key, and a region
//! key every field of a project key.
//!
//! An empty value is a wildcard. A key with every value empty is the system scope of its layer.
use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::QuotaError;

/// Domain identifier field.
pub const DOMAIN_ID: &str = "domain_id";
/// Project identifier field.
pub const TENANT_ID: &str = "tenant_id";
/// Cloud provider field.
pub const PROVIDER: &str = "provider";
/// Hypervisor brand field.
pub const BRAND: &str = "brand";
/// Cloud environment field (public, private, on-premise).
pub const CLOUD_ENV: &str = "cloud_env";
/// Cloud account field.
pub const ACCOUNT_ID: &str = "account_id";
/// Cloud provider manager field.
pub const MANAGER_ID: &str = "manager_id";
/// Region field.
pub const REGION_ID: &str = "region_id";
/// Zone field.
pub const ZONE_ID: &str = "zone_id";

const DOMAIN_FIELDS: &[&str] = &[DOMAIN_ID];
const PROJECT_FIELDS: &[&str] = &[DOMAIN_ID, TENANT_ID];
const DOMAIN_CLOUD_FIELDS: &[&str] = &[DOMAIN_ID, PROVIDER, BRAND, CLOUD_ENV, ACCOUNT_ID, MANAGER_ID];
const PROJECT_CLOUD_FIELDS: &[&str] = &[DOMAIN_ID, TENANT_ID, PROVIDER, BRAND, CLOUD_ENV, ACCOUNT_ID, MANAGER_ID];
const DOMAIN_REGION_FIELDS: &[&str] = &[
    DOMAIN_ID, PROVIDER, BRAND, CLOUD_ENV, ACCOUNT_ID, MANAGER_ID, REGION_ID,
];
const PROJECT_REGION_FIELDS: &[&str] = &[
    DOMAIN_ID, TENANT_ID, PROVIDER, BRAND, CLOUD_ENV, ACCOUNT_ID, MANAGER_ID, REGION_ID,
];
const PROJECT_ZONE_FIELDS: &[&str] = &[
    DOMAIN_ID, TENANT_ID, PROVIDER, BRAND, CLOUD_ENV, ACCOUNT_ID, MANAGER_ID, REGION_ID, ZONE_ID,
];

/// Key schema.
///
/// Each layer's field list extends a less specific layer's list.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyLayer {
    /// `domain_id`
    Domain,

    /// `domain_id`, `tenant_id`
    Project,

    /// Domain plus provider, brand, cloud environment, account and manager.
    DomainCloud,

    /// Project plus provider, brand, cloud environment, account and manager.
    ProjectCloud,

    /// Domain cloud plus region.
    DomainRegion,

    /// Project cloud plus region.
    ProjectRegion,

    /// Project region plus zone.
    ProjectZone,
}

impl KeyLayer {
    /// All layers, least specific first.
    pub const ALL: [KeyLayer; 7] = [
        Self::Domain,
        Self::Project,
        Self::DomainCloud,
        Self::ProjectCloud,
        Self::DomainRegion,
        Self::ProjectRegion,
        Self::ProjectZone,
    ];

    /// Returns the ordered field names of this layer.
    pub const fn fields(self) -> &'static [&'static str] {
        match self {
            Self::Domain => DOMAIN_FIELDS,
            Self::Project => PROJECT_FIELDS,
            Self::DomainCloud => DOMAIN_CLOUD_FIELDS,
            Self::ProjectCloud => PROJECT_CLOUD_FIELDS,
            Self::DomainRegion => DOMAIN_REGION_FIELDS,
            Self::ProjectRegion => PROJECT_REGION_FIELDS,
            Self::ProjectZone => PROJECT_ZONE_FIELDS,
        }
    }

    /// Returns the configuration name of this layer.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Project => "project",
            Self::DomainCloud => "domain_cloud",
            Self::ProjectCloud => "project_cloud",
            Self::DomainRegion => "domain_region",
            Self::ProjectRegion => "project_region",
            Self::ProjectZone => "project_zone",
        }
    }

    fn position(self, field: &str) -> Option<usize> {
        self.fields().iter().position(|f| *f == field)
    }
}

impl fmt::Display for KeyLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyLayer {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|layer| layer.as_str() == s)
            .ok_or_else(|| QuotaError::InvalidKey {
                reason: format!("unknown key layer '{}'", s),
            })
    }
}

/// Coarse scope classification of a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scope {
    /// Neither domain nor project is set.
    System,

    /// Domain is set, project is not.
    Domain,

    /// Domain and project are both set.
    Project,

    /// Project is set without a domain.
    None,
}

/// How two keys relate to each other.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Relation {
    /// Same values.
    Equal,

    /// The left key is more general and covers the right key.
    Contain,

    /// The left key is more specific and is covered by the right key.
    Belong,

    /// Neither key covers the other.
    Exclude,
}

impl Relation {
    /// Returns the relation seen from the other key.
    pub const fn inverse(self) -> Self {
        match self {
            Self::Contain => Self::Belong,
            Self::Belong => Self::Contain,
            other => other,
        }
    }

    fn of_values(a: &str, b: &str) -> Self {
        if a == b {
            Self::Equal
        } else if a.is_empty() {
            Self::Contain
        } else if b.is_empty() {
            Self::Belong
        } else {
            Self::Exclude
        }
    }

    const fn bit(self) -> u8 {
        match self {
            Self::Equal => 1,
            Self::Contain => 2,
            Self::Belong => 4,
            Self::Exclude => 8,
        }
    }
}

/// The scope a quota row applies to.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ScopeKey {
    layer: KeyLayer,
    values: Vec<String>,
}

impl ScopeKey {
    /// Creates the system key of the given layer.
    pub fn system(layer: KeyLayer) -> Self {
        Self {
            layer,
            values: vec![String::new(); layer.fields().len()],
        }
    }

    /// Creates a key from `(field, value)` pairs.
    ///
    /// Fields that are not given stay empty.
    ///
    /// # Errors
    ///
    /// If a field does not belong to `layer`, an error is returned.
    pub fn from_pairs<I, K, V>(layer: KeyLayer, pairs: I) -> Result<Self, QuotaError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        pairs
            .into_iter()
            .try_fold(Self::system(layer), |key, (field, value)| key.with(field.as_ref(), value))
    }

    /// Creates a project key.
    pub fn project(domain_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            layer: KeyLayer::Project,
            values: vec![domain_id.into(), tenant_id.into()],
        }
    }

    /// Creates a domain key.
    pub fn domain(domain_id: impl Into<String>) -> Self {
        Self {
            layer: KeyLayer::Domain,
            values: vec![domain_id.into()],
        }
    }

    /// Returns this key with `field` set to `value`.
    ///
    /// # Errors
    ///
    /// If `field` does not belong to this key's layer, an error is returned.
    pub fn with(mut self, field: &str, value: impl Into<String>) -> Result<Self, QuotaError> {
        match self.layer.position(field) {
            Some(idx) => {
                self.values[idx] = value.into();
                Ok(self)
            }
            None => Err(QuotaError::InvalidKey {
                reason: format!("field '{}' is not part of the '{}' layer", field, self.layer),
            }),
        }
    }

    /// Returns the layer of this key.
    pub const fn layer(&self) -> KeyLayer {
        self.layer
    }

    /// Returns the ordered field names.
    pub fn fields(&self) -> &'static [&'static str] {
        self.layer.fields()
    }

    /// Returns the field values, aligned with [`fields`][Self::fields].
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Returns the value of `field`, or `None` if it is empty or not part of this layer.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.layer
            .position(field)
            .map(|idx| self.values[idx].as_str())
            .filter(|v| !v.is_empty())
    }

    /// Returns the domain ID, if set.
    pub fn domain_id(&self) -> Option<&str> {
        self.get(DOMAIN_ID)
    }

    /// Returns the project ID, if set.
    pub fn tenant_id(&self) -> Option<&str> {
        self.get(TENANT_ID)
    }

    /// Iterates over populated `(field, value)` pairs.
    pub fn populated(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.fields()
            .iter()
            .zip(self.values.iter())
            .filter(|(_, v)| !v.is_empty())
            .map(|(f, v)| (*f, v.as_str()))
    }

    /// Lexicographic order over values.
    ///
    /// Only meaningful as a tie-break between keys of the same layer.
    pub fn compare(&self, other: &ScopeKey) -> Ordering {
        self.values.cmp(&other.values)
    }

    /// Returns the coarse scope of this key.
    pub fn scope(&self) -> Scope {
        match (self.domain_id().is_some(), self.tenant_id().is_some()) {
            (false, false) => Scope::System,
            (true, false) => Scope::Domain,
            (true, true) => Scope::Project,
            (false, true) => Scope::None,
        }
    }

    /// Bitmask of populated fields, bit `i` set when field `i` has a value.
    pub fn mask(&self) -> u32 {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    /// Number of populated fields. Zero is the system scope.
    pub fn weight(&self) -> u32 {
        self.mask().count_ones()
    }

    /// Returns `true` if every field is populated, so no other key of the layer is within this one.
    pub fn is_complete(&self) -> bool {
        self.values.iter().all(|v| !v.is_empty())
    }

    /// Returns `true` if only the domain and project fields may be populated.
    pub fn is_base(&self) -> bool {
        self.populated().all(|(f, _)| f == DOMAIN_ID || f == TENANT_ID)
    }

    /// Projects this key onto a less specific layer.
    ///
    /// # Errors
    ///
    /// If `layer` has a field this key's layer does not, an error is returned.
    pub fn reduce_to(&self, layer: KeyLayer) -> Result<ScopeKey, QuotaError> {
        if layer == self.layer {
            return Ok(self.clone());
        }

        let mut values = Vec::with_capacity(layer.fields().len());
        for field in layer.fields() {
            match self.layer.position(field) {
                Some(idx) => values.push(self.values[idx].clone()),
                None => {
                    return Err(QuotaError::InvalidKey {
                        reason: format!("cannot reduce '{}' key to '{}': missing field '{}'", self.layer, layer, field),
                    })
                }
            }
        }

        Ok(ScopeKey { layer, values })
    }

    /// Period-joined values of every field after the domain and project fields.
    ///
    /// Positions are kept, so empty fields show up as empty segments.
    pub fn platform(&self) -> String {
        self.fields()
            .iter()
            .zip(self.values.iter())
            .filter(|(f, _)| **f != DOMAIN_ID && **f != TENANT_ID)
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Stable string form, used for lock names and log fields.
    pub fn key_string(&self) -> String {
        self.to_string()
    }

    /// Computes how this key relates to `other`.
    ///
    /// Keys with different field lists always `Exclude` each other.
    pub fn relation(&self, other: &ScopeKey) -> Relation {
        if self.fields() != other.fields() {
            return Relation::Exclude;
        }

        let seen = self
            .values
            .iter()
            .zip(other.values.iter())
            .fold(0u8, |seen, (a, b)| seen | Relation::of_values(a, b).bit());

        let equal = Relation::Equal.bit();
        match seen {
            s if s == equal => Relation::Equal,
            s if s & !equal == Relation::Contain.bit() => Relation::Contain,
            s if s & !equal == Relation::Belong.bit() => Relation::Belong,
            _ => Relation::Exclude,
        }
    }

    /// Returns `true` if this key covers `other` and is not equal to it.
    pub fn contains(&self, other: &ScopeKey) -> bool {
        self.relation(other) == Relation::Contain
    }

    /// Returns `true` if this key is equal to or covered by `other`.
    pub fn is_within(&self, other: &ScopeKey) -> bool {
        matches!(self.relation(other), Relation::Equal | Relation::Belong)
    }

    /// Specificity order: general before specific.
    ///
    /// A key that contains another sorts first; otherwise fewer populated fields sort first, then values are compared
    /// lexicographically. Keys of different layers fall back to the layer order.
    pub fn specificity_cmp(&self, other: &ScopeKey) -> Ordering {
        match self.relation(other) {
            Relation::Contain => Ordering::Less,
            Relation::Belong => Ordering::Greater,
            _ => self
                .weight()
                .cmp(&other.weight())
                .then_with(|| self.compare(other))
                .then_with(|| self.layer.cmp(&other.layer)),
        }
    }

    /// Returns `true` if this key sorts before `other` in specificity order.
    pub fn less(&self, other: &ScopeKey) -> bool {
        self.specificity_cmp(other) == Ordering::Less
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.layer)?;

        let mut written = 0;
        for (field, value) in self.populated() {
            if written > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", field, value)?;
            written += 1;
        }

        if written == 0 {
            f.write_str("system")?;
        }

        Ok(())
    }
}

/// Sorts items by the specificity of their keys, most general first.
///
/// The sort is stable.
pub fn sort_by_specificity<T, F>(items: &mut [T], key: F)
where
    F: Fn(&T) -> &ScopeKey,
{
    items.sort_by(|a, b| key(a).specificity_cmp(key(b)));
}

/// Returns the most specific item, if any.
pub fn most_specific<T, F>(items: &[T], key: F) -> Option<&T>
where
    F: Fn(&T) -> &ScopeKey,
{
    items.iter().max_by(|a, b| key(a).specificity_cmp(key(b)))
}

/// Returns the items whose keys contain `scope`, most general first.
pub fn ancestors_of<'a, T, F>(scope: &ScopeKey, items: &'a [T], key: F) -> Vec<&'a T>
where
    F: Fn(&T) -> &ScopeKey,
{
    let mut found = items.iter().filter(|item| key(item).contains(scope)).collect::<Vec<_>>();
    found.sort_by(|a, b| key(a).specificity_cmp(key(b)));
    found
}

/// Returns the items whose keys are contained by `scope`, most general first.
pub fn descendants_of<'a, T, F>(scope: &ScopeKey, items: &'a [T], key: F) -> Vec<&'a T>
where
    F: Fn(&T) -> &ScopeKey,
{
    let mut found = items.iter().filter(|item| scope.contains(key(item))).collect::<Vec<_>>();
    found.sort_by(|a, b| key(a).specificity_cmp(key(b)));
    found
}
