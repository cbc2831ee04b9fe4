//! Quota value objects.
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{ExceededField, QuotaError, StoreError},
    scope::{KeyLayer, ScopeKey},
};

/// A numeric field of a quota kind.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct QuotaField {
    /// Field name, such as `cpu` or `memory`.
    pub name: String,

    /// System default limit, used when a scope has no stored quota.
    #[serde(default)]
    pub default: u64,
}

impl QuotaField {
    /// Creates a new `QuotaField`.
    pub fn new(name: impl Into<String>, default: u64) -> Self {
        Self {
            name: name.into(),
            default,
        }
    }
}

/// Describes one quota kind: its name, the key layer its rows are scoped by, and its fields.
#[derive(Debug, Eq, PartialEq)]
pub struct QuotaSchema {
    name: String,
    layer: KeyLayer,
    fields: Vec<QuotaField>,
}

impl QuotaSchema {
    /// Creates a new `QuotaSchema`.
    pub fn new(name: impl Into<String>, layer: KeyLayer, fields: Vec<QuotaField>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            layer,
            fields,
        })
    }

    /// Returns the kind name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the key layer of rows of this kind.
    pub fn layer(&self) -> KeyLayer {
        self.layer
    }

    /// Returns the fields of this kind.
    pub fn fields(&self) -> &[QuotaField] {
        &self.fields
    }

    /// Returns the position of `field`.
    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == field)
    }

    /// Decodes a quota from its flat JSON form.
    ///
    /// With a prefix, fields are read from `prefix.field`. Missing fields decode as zero. Unknown members are ignored.
    ///
    /// # Errors
    ///
    /// If `json` is not an object, or a field is not a non-negative integer, an error is returned.
    pub fn decode(self: &Arc<Self>, key: ScopeKey, json: &Value, prefix: Option<&str>) -> Result<Quota, StoreError> {
        let object = json.as_object().ok_or_else(|| StoreError::Decode {
            key: key.key_string(),
            reason: "expected a JSON object".to_string(),
        })?;

        let mut quota = Quota::zero(self, key);
        for (idx, field) in self.fields.iter().enumerate() {
            let name = prefixed(prefix, &field.name);
            if let Some(raw) = object.get(&name) {
                quota.values[idx] = raw.as_u64().ok_or_else(|| StoreError::Decode {
                    key: quota.key.key_string(),
                    reason: format!("field '{}' is not a non-negative integer: {}", name, raw),
                })?;
            }
        }

        Ok(quota)
    }
}

fn prefixed(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, name),
        None => name.to_string(),
    }
}

/// Limits, usage or a reservation of one quota kind for one scope.
///
/// The same type carries limits, persisted usage, pending reservations and request deltas; the store it lives in
/// decides what it means.
#[derive(Clone)]
pub struct Quota {
    schema: Arc<QuotaSchema>,
    key: ScopeKey,
    values: Vec<u64>,
    version: u64,
    updated_at: Option<DateTime<Utc>>,
}

impl Quota {
    /// Creates a quota with every field at zero.
    pub fn zero(schema: &Arc<QuotaSchema>, key: ScopeKey) -> Self {
        Self {
            schema: Arc::clone(schema),
            key,
            values: vec![0; schema.fields.len()],
            version: 0,
            updated_at: None,
        }
    }

    /// Creates a quota with every field at its system default.
    pub fn defaults(schema: &Arc<QuotaSchema>, key: ScopeKey) -> Self {
        let mut quota = Self::zero(schema, key);
        quota.fill_defaults();
        quota
    }

    /// Creates a quota from `(field, value)` pairs. Fields that are not given are zero.
    ///
    /// # Errors
    ///
    /// If a field is not part of the schema, an error is returned.
    pub fn from_pairs<I, S>(schema: &Arc<QuotaSchema>, key: ScopeKey, pairs: I) -> Result<Self, QuotaError>
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut quota = Self::zero(schema, key);
        for (field, value) in pairs {
            quota.set(field.as_ref(), value)?;
        }
        Ok(quota)
    }

    /// Returns the kind name.
    pub fn kind(&self) -> &str {
        &self.schema.name
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<QuotaSchema> {
        &self.schema
    }

    /// Returns the scope key.
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// Returns the field values, aligned with the schema's fields.
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// Returns the value of `field`.
    pub fn get(&self, field: &str) -> Option<u64> {
        self.schema.field_index(field).map(|idx| self.values[idx])
    }

    /// Sets the value of `field`.
    ///
    /// # Errors
    ///
    /// If the field is not part of the schema, an error is returned.
    pub fn set(&mut self, field: &str, value: u64) -> Result<(), QuotaError> {
        let idx = self.schema.field_index(field).ok_or_else(|| QuotaError::UnknownField {
            kind: self.schema.name.clone(),
            field: field.to_string(),
        })?;
        self.values[idx] = value;
        Ok(())
    }

    /// Returns the same values under a different key.
    pub fn with_key(mut self, key: ScopeKey) -> Self {
        self.key = key;
        self
    }

    /// Returns the optimistic-concurrency version. Zero for rows that were never stored.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns when the row was last written.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub(crate) fn stored(mut self, version: u64, updated_at: DateTime<Utc>) -> Self {
        self.version = version;
        self.updated_at = Some(updated_at);
        self
    }

    pub(crate) fn with_version(mut self, version: u64, updated_at: Option<DateTime<Utc>>) -> Self {
        self.version = version;
        self.updated_at = updated_at;
        self
    }

    fn same_kind(&self, other: &Quota) -> Result<(), QuotaError> {
        if Arc::ptr_eq(&self.schema, &other.schema) || self.schema.name == other.schema.name {
            Ok(())
        } else {
            Err(QuotaError::KindMismatch {
                expected: self.schema.name.clone(),
                actual: other.schema.name.clone(),
            })
        }
    }

    /// Adds `other` field by field.
    ///
    /// Both quotas must be of the same kind.
    pub fn add(&mut self, other: &Quota) {
        debug_assert_eq!(self.kind(), other.kind());
        for (v, o) in self.values.iter_mut().zip(other.values.iter()) {
            *v = v.saturating_add(*o);
        }
    }

    /// Subtracts `other` field by field, stopping at zero.
    ///
    /// Both quotas must be of the same kind.
    pub fn sub(&mut self, other: &Quota) {
        debug_assert_eq!(self.kind(), other.kind());
        for (v, o) in self.values.iter_mut().zip(other.values.iter()) {
            *v = v.saturating_sub(*o);
        }
    }

    /// Adds `other` field by field.
    ///
    /// # Errors
    ///
    /// If `other` is of a different kind, an error is returned and `self` is unchanged.
    pub fn try_add(&mut self, other: &Quota) -> Result<(), QuotaError> {
        self.same_kind(other)?;
        self.add(other);
        Ok(())
    }

    /// Subtracts `other` field by field, stopping at zero.
    ///
    /// # Errors
    ///
    /// If `other` is of a different kind, an error is returned and `self` is unchanged.
    pub fn try_sub(&mut self, other: &Quota) -> Result<(), QuotaError> {
        self.same_kind(other)?;
        self.sub(other);
        Ok(())
    }

    /// Returns `true` if every field is zero.
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|v| *v == 0)
    }

    /// Resets every field to its system default.
    pub fn fill_defaults(&mut self) {
        for (v, field) in self.values.iter_mut().zip(self.schema.fields.iter()) {
            *v = field.default;
        }
    }

    /// Returns every field where this quota is above `limit`.
    ///
    /// The exceeded entries carry the limit's scope.
    pub fn exceed(&self, limit: &Quota) -> Vec<ExceededField> {
        debug_assert_eq!(self.kind(), limit.kind());
        self.schema
            .fields
            .iter()
            .zip(self.values.iter().zip(limit.values.iter()))
            .filter(|(_, (used, limit))| used > limit)
            .map(|(field, (used, max))| ExceededField {
                scope: limit.key.clone(),
                field: field.name.clone(),
                limit: *max,
                used: *used,
            })
            .collect()
    }

    /// Applies an administrative update.
    ///
    /// # Errors
    ///
    /// If the update names a field that is not part of the schema, an error is returned and `self` is unchanged.
    pub fn apply(&mut self, action: QuotaAction, update: &QuotaUpdate) -> Result<(), QuotaError> {
        let mut delta = Quota::zero(&self.schema, self.key.clone());
        for (field, value) in update.iter() {
            delta.set(field, value)?;
        }

        match action {
            QuotaAction::Add => self.add(&delta),
            QuotaAction::Sub => self.sub(&delta),
            QuotaAction::Reset => self.fill_defaults(),
            QuotaAction::Replace => self.values = delta.values,
            QuotaAction::Update => {
                for (field, value) in update.iter() {
                    self.set(field, value)?;
                }
            }
        }

        Ok(())
    }

    /// Renders the fields as a flat JSON object, optionally under `prefix.`.
    pub fn to_json(&self, prefix: Option<&str>) -> Map<String, Value> {
        self.schema
            .fields
            .iter()
            .zip(self.values.iter())
            .map(|(field, value)| (prefixed(prefix, &field.name), Value::from(*value)))
            .collect()
    }
}

impl PartialEq for Quota {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name == other.schema.name && self.key == other.key && self.values == other.values
    }
}

impl fmt::Debug for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        map.entry(&"kind", &self.schema.name).entry(&"key", &self.key.key_string());
        for (field, value) in self.schema.fields.iter().zip(self.values.iter()) {
            map.entry(&field.name, value);
        }
        map.entry(&"version", &self.version).finish()
    }
}

/// Administrative set action.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaAction {
    /// Add the given values to the current limits.
    Add,

    /// Subtract the given values from the current limits.
    Sub,

    /// Restore the system defaults.
    Reset,

    /// Set the given values and zero every other field.
    Replace,

    /// Set the given values and keep every other field.
    Update,
}

impl FromStr for QuotaAction {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "sub" => Ok(Self::Sub),
            "reset" => Ok(Self::Reset),
            "replace" => Ok(Self::Replace),
            "update" => Ok(Self::Update),
            other => Err(QuotaError::InvalidAction {
                action: other.to_string(),
            }),
        }
    }
}

/// A partial set of field values.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QuotaUpdate {
    values: BTreeMap<String, u64>,
}

impl QuotaUpdate {
    /// Creates an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this update with `field` set to `value`.
    pub fn with(mut self, field: impl Into<String>, value: u64) -> Self {
        self.values.insert(field.into(), value);
        self
    }

    /// Iterates over the fields of the update in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Returns `true` if no field is set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for QuotaUpdate {
    fn from_iter<T: IntoIterator<Item = (S, u64)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::test_util::{compute_schema, d1_t1};

    fn compute(cpu: u64, memory: u64) -> Quota {
        Quota::from_pairs(&compute_schema(), d1_t1(), [("cpu", cpu), ("memory", memory)]).unwrap()
    }

    #[test]
    fn arithmetic_saturates_at_zero() {
        let mut quota = compute(5, 100);
        quota.sub(&compute(7, 40));
        assert_eq!(quota.values(), &[0, 60]);

        quota.add(&compute(2, 2));
        assert_eq!(quota.values(), &[2, 62]);
    }

    #[test]
    fn checked_arithmetic_rejects_other_kinds() {
        let other = QuotaSchema::new("storage", KeyLayer::Project, vec![QuotaField::new("cpu", 0)]);
        let mut quota = compute(1, 1);
        let err = quota.try_add(&Quota::zero(&other, d1_t1())).unwrap_err();

        assert!(matches!(err, QuotaError::KindMismatch { .. }));
        assert_eq!(quota.values(), &[1, 1]);
    }

    #[test]
    fn exceed_lists_every_field() {
        let used = compute(11, 2048);
        let limit = compute(10, 1024);
        let exceeded = used.exceed(&limit);

        assert_eq!(exceeded.len(), 2);
        assert_eq!(exceeded[0].field, "cpu");
        assert_eq!((exceeded[0].limit, exceeded[0].used), (10, 11));
        assert_eq!(exceeded[1].field, "memory");

        assert!(compute(10, 1024).exceed(&limit).is_empty());
    }

    #[test]
    fn defaults_and_emptiness() {
        let mut quota = Quota::zero(&compute_schema(), d1_t1());
        assert!(quota.is_empty());

        quota.fill_defaults();
        assert_eq!(quota.values(), &[10, 1024]);
        assert!(!quota.is_empty());
    }

    #[test]
    fn actions_merge_over_current_values() {
        let update = QuotaUpdate::new().with("cpu", 4);

        let mut quota = compute(8, 512);
        quota.apply(QuotaAction::Update, &update).unwrap();
        assert_eq!(quota.values(), &[4, 512]);

        quota.apply(QuotaAction::Replace, &update).unwrap();
        assert_eq!(quota.values(), &[4, 0]);

        quota.apply(QuotaAction::Add, &update).unwrap();
        assert_eq!(quota.values(), &[8, 0]);

        quota.apply(QuotaAction::Sub, &update).unwrap();
        assert_eq!(quota.values(), &[4, 0]);

        quota.apply(QuotaAction::Reset, &QuotaUpdate::new()).unwrap();
        assert_eq!(quota.values(), &[10, 1024]);

        let err = quota.apply(QuotaAction::Update, &QuotaUpdate::new().with("gpu", 1)).unwrap_err();
        assert!(matches!(err, QuotaError::UnknownField { .. }));
        assert_eq!(quota.values(), &[10, 1024]);
    }

    #[test]
    fn json_view() {
        let quota = compute(3, 256);
        assert_eq!(Value::Object(quota.to_json(None)), json!({"cpu": 3, "memory": 256}));
        assert_eq!(
            Value::Object(quota.to_json(Some("usage"))),
            json!({"usage.cpu": 3, "usage.memory": 256})
        );

        let decoded = compute_schema()
            .decode(d1_t1(), &json!({"quota.cpu": 7, "other": "x"}), Some("quota"))
            .unwrap();
        assert_eq!(decoded.values(), &[7, 0]);

        let err = compute_schema().decode(d1_t1(), &json!({"cpu": -1}), None).unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[test]
    fn action_names() {
        assert_eq!("replace".parse::<QuotaAction>().unwrap(), QuotaAction::Replace);
        assert!("delete".parse::<QuotaAction>().is_err());
    }

    proptest! {
        #[test]
        fn property_add_then_sub_is_identity(a in 0u64..1 << 40, b in 0u64..1 << 40, c in 0u64..1 << 40) {
            let mut quota = compute(a, b);
            let delta = compute(c, a);
            quota.add(&delta);
            quota.sub(&delta);
            prop_assert_eq!(quota, compute(a, b));
        }

        #[test]
        fn property_exceed_is_monotonic(
            base in 0u64..32, limit in 0u64..32, d1 in 0u64..32, extra in 0u64..32,
        ) {
            let limit = compute(limit, limit);
            let mut small = compute(base, 0);
            small.add(&compute(d1, 0));
            let mut large = small.clone();
            large.add(&compute(extra, 0));

            let small_fields = small.exceed(&limit).into_iter().map(|e| e.field).collect::<Vec<_>>();
            let large_fields = large.exceed(&limit).into_iter().map(|e| e.field).collect::<Vec<_>>();
            for field in small_fields {
                prop_assert!(large_fields.contains(&field));
            }
        }
    }
}
