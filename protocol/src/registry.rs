//! Parameter registry.
//!
//! The [`ParameterRegistry`] maps parameter names and indices to [`Parameter`]
//! definitions. It starts out with a compiled default table and is updated from
//! element discovery results with [`ParameterRegistry::override_from_discovery`].

mod table;

use crate::{
    Error, Result,
    codec::{self, Value, ValueFormat},
    discovery::DiscoveredElement,
    message,
};
use core::{
    fmt::{Display, Formatter},
    str::FromStr,
};
use log::{debug, info, warn};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
};

/// Definition of a device parameter.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Parameter {
    /// Firmware-assigned index.
    pub idx: u16,
    /// External ID as 14 uppercase hex digits.
    pub ext_id: String,
    /// Smallest raw value.
    pub min: i32,
    /// Largest raw value.
    pub max: i32,
    /// Numeric format.
    pub format: ValueFormat,
    /// Whether writes are rejected.
    pub read_only: bool,
    /// Parameter name as reported by the device.
    pub name: String,
}

impl Parameter {
    /// Returns the identifier of read requests, which is also the write target.
    #[must_use]
    pub fn request_id(&self) -> u32 {
        message::request_id(self.idx)
    }

    /// Returns the identifier of read responses.
    #[must_use]
    pub fn response_id(&self) -> u32 {
        message::response_id(self.idx)
    }

    /// Encodes a value, checking it against the parameter's format and bounds.
    pub fn encode(&self, value: f64) -> codec::Result<Vec<u8>> {
        codec::encode(self.format, value, self.min, self.max)
    }

    /// Decodes a response payload.
    pub fn decode(&self, data: &[u8]) -> codec::Result<Value> {
        codec::decode(self.format, data, self.min)
    }
}

/// Reference to a parameter by name or by index.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum ParameterKey {
    /// Case-insensitive parameter name.
    Name(String),
    /// Firmware-assigned index.
    Index(u16),
}

impl Display for ParameterKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Index(idx) => write!(f, "#{idx}"),
        }
    }
}

impl From<&str> for ParameterKey {
    fn from(name: &str) -> Self {
        Self::Name(name.into())
    }
}

impl From<String> for ParameterKey {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<u16> for ParameterKey {
    fn from(idx: u16) -> Self {
        Self::Index(idx)
    }
}

impl FromStr for ParameterKey {
    type Err = core::convert::Infallible;

    /// Parses decimal digits as an index and anything else as a name.
    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let s = s.trim();

        Ok(s.parse()
            .map_or_else(|_| Self::Name(s.into()), Self::Index))
    }
}

/// Name and index maps, always consistent with each other.
#[derive(Clone, Debug, Default)]
struct Tables {
    by_name: HashMap<String, Parameter>,
    by_index: HashMap<u16, String>,
}

impl Tables {
    fn from_parameters(params: impl IntoIterator<Item = Parameter>) -> Self {
        let mut tables = Self::default();

        for param in params {
            let key = param.name.to_uppercase();

            tables.by_index.insert(param.idx, key.clone());
            tables.by_name.insert(key, param);
        }

        tables
    }

    fn resolve(&self, key: &ParameterKey) -> Option<&Parameter> {
        match key {
            ParameterKey::Name(name) => self.by_name.get(&name.to_uppercase()),
            ParameterKey::Index(idx) => self
                .by_index
                .get(idx)
                .and_then(|owner| self.by_name.get(owner)),
        }
    }

    /// Returns the name of the parameter owning the index of `param`, if that
    /// is not `param` itself.
    fn index_owner(&self, param: &Parameter) -> Option<&str> {
        let owner = self.by_index.get(&param.idx)?;

        if *owner == param.name.to_uppercase() {
            None
        } else {
            Some(
                self.by_name
                    .get(owner)
                    .map_or(owner.as_str(), |other| other.name.as_str()),
            )
        }
    }
}

/// Registry of device parameters.
///
/// Lookups by name are case-insensitive. Updates replace both maps at once,
/// so concurrent lookups never observe a partially updated table.
#[derive(Debug)]
pub struct ParameterRegistry {
    tables: RwLock<Arc<Tables>>,
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterRegistry {
    /// Constructs a registry from the compiled default table.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parameters(table::DEFAULT_TABLE.iter().map(|entry| Parameter {
            idx: entry.idx,
            ext_id: entry.ext_id.into(),
            min: entry.min,
            max: entry.max,
            format: entry.format,
            read_only: entry.read_only,
            name: entry.name.into(),
        }))
    }

    /// Constructs a registry from the given parameters.
    ///
    /// Later parameters replace earlier ones with the same name or index.
    #[must_use]
    pub fn with_parameters(params: impl IntoIterator<Item = Parameter>) -> Self {
        Self {
            tables: RwLock::new(Arc::new(Tables::from_parameters(params))),
        }
    }

    fn tables(&self) -> Arc<Tables> {
        Arc::clone(&self.tables.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Returns the parameter with the given name.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<Parameter> {
        self.resolve(&ParameterKey::Name(name.into()))
    }

    /// Returns the parameter with the given index.
    #[must_use]
    pub fn get_by_index(&self, idx: u16) -> Option<Parameter> {
        self.resolve(&ParameterKey::Index(idx))
    }

    /// Resolves a parameter reference.
    ///
    /// A name resolves even if its index belongs to another parameter. Use
    /// [`ParameterRegistry::lookup`] before sending anything to the device.
    #[must_use]
    pub fn resolve(&self, key: &ParameterKey) -> Option<Parameter> {
        self.tables().resolve(key).cloned()
    }

    /// Resolves a parameter reference for a read or write.
    ///
    /// Fails with [`Error::IndexConflict`] if the parameter's index is owned by
    /// another parameter, because requests on that index would reach the owner.
    /// This happens to static parameters the device did not report when a
    /// discovered parameter took their index.
    pub fn lookup<E>(&self, key: &ParameterKey) -> Result<Parameter, E> {
        let tables = self.tables();
        let param = tables
            .resolve(key)
            .ok_or_else(|| Error::UnknownParameter(key.clone()))?;

        match tables.index_owner(param) {
            Some(owner) => Err(Error::IndexConflict {
                name: param.name.clone(),
                idx: param.idx,
                owner: owner.into(),
            }),
            None => Ok(param.clone()),
        }
    }

    /// Returns whether the parameter's index is owned by another parameter.
    #[must_use]
    pub fn is_shadowed(&self, name: &str) -> bool {
        let tables = self.tables();

        tables
            .by_name
            .get(&name.to_uppercase())
            .is_some_and(|param| tables.index_owner(param).is_some())
    }

    /// Returns whether the reference resolves to a parameter.
    #[must_use]
    pub fn contains(&self, key: &ParameterKey) -> bool {
        self.resolve(key).is_some()
    }

    /// Returns all parameters sorted by index.
    #[must_use]
    pub fn parameters(&self) -> Vec<Parameter> {
        let mut params: Vec<_> = self.tables().by_name.values().cloned().collect();

        params.sort_by(|a, b| a.idx.cmp(&b.idx).then_with(|| a.name.cmp(&b.name)));
        params
    }

    /// Returns the number of known parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables().by_name.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies discovery results and returns the number of changed parameters.
    ///
    /// Known names take the discovered index, external ID and bounds, but keep
    /// their format and read-only flag. Unknown names are added as writable
    /// integer parameters. Discovered parameters own their index, so a static
    /// parameter whose index was taken keeps its name but is shadowed: it can
    /// no longer be reached by index and [`ParameterRegistry::lookup`] rejects
    /// it. Indices are claimed by discovered parameters in reporting order,
    /// then by the remaining parameters in name order.
    ///
    /// Concurrent updates are applied one after another.
    pub fn override_from_discovery(&self, elements: &[DiscoveredElement]) -> usize {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let mut by_name = tables.by_name.clone();
        let mut discovered = HashSet::new();
        let mut order = Vec::with_capacity(elements.len());
        let mut changed = 0;

        for element in elements {
            let key = element.name.to_uppercase();

            if discovered.insert(key.clone()) {
                order.push(key.clone());
            } else {
                warn!("Element {} reported more than once", element.name);
            }

            match by_name.get_mut(&key) {
                Some(param) => {
                    if param.idx != element.idx
                        || param.ext_id != element.ext_id
                        || param.min != element.min
                        || param.max != element.max
                    {
                        debug!(
                            "Updating {}: index {} -> {}",
                            param.name, param.idx, element.idx
                        );
                        param.idx = element.idx;
                        param.ext_id.clone_from(&element.ext_id);
                        param.min = element.min;
                        param.max = element.max;
                        changed += 1;
                    }
                }
                None => {
                    debug!("Adding {} at index {}", element.name, element.idx);
                    by_name.insert(
                        key,
                        Parameter {
                            idx: element.idx,
                            ext_id: element.ext_id.clone(),
                            min: element.min,
                            max: element.max,
                            format: ValueFormat::Int,
                            read_only: false,
                            name: element.name.clone(),
                        },
                    );
                    changed += 1;
                }
            }
        }

        let mut by_index = HashMap::with_capacity(by_name.len());
        let mut rest: Vec<_> = by_name
            .keys()
            .filter(|key| !discovered.contains(*key))
            .cloned()
            .collect();

        rest.sort_unstable();

        for key in order.into_iter().chain(rest) {
            let Some(param) = by_name.get(&key) else {
                continue;
            };

            match by_index.get(&param.idx) {
                None => {
                    by_index.insert(param.idx, key);
                }
                Some(owner) => warn!(
                    "Index {} of {} is taken by {owner}, parameter is shadowed",
                    param.idx, param.name
                ),
            }
        }

        *tables = Arc::new(Tables { by_name, by_index });

        info!(
            "Applied {} discovered element(s), {changed} parameter(s) changed",
            elements.len()
        );

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    fn element(idx: u16, name: &str, min: i32, max: i32) -> DiscoveredElement {
        DiscoveredElement {
            idx,
            ext_id: "61E1E1FC660023".into(),
            name: name.into(),
            min,
            max,
        }
    }

    #[test]
    fn lookup() {
        let registry = ParameterRegistry::new();
        let param = registry.get_by_name("xdhw_time").unwrap();

        assert_eq!(param.idx, 2475, "index should be correct");
        assert_eq!(param.name, "XDHW_TIME", "name should be correct");
        assert_eq!(
            registry.get_by_index(2475),
            Some(param.clone()),
            "index lookup should agree"
        );
        assert_eq!(
            registry.resolve(&"XdHw_TiMe".into()),
            Some(param),
            "name lookup should be case-insensitive"
        );
        assert_eq!(registry.get_by_name("NO_SUCH"), None, "unknown name");
        assert_eq!(registry.get_by_index(4095), None, "unknown index");
        assert!(!registry.is_empty(), "registry should not be empty");
    }

    #[test]
    fn keys() {
        assert_eq!("2480".parse(), Ok(ParameterKey::Index(2480)), "digits are an index");
        assert_eq!(
            "GT3_TEMP".parse(),
            Ok(ParameterKey::Name("GT3_TEMP".into())),
            "anything else is a name"
        );
        assert_eq!(
            "99999".parse(),
            Ok(ParameterKey::Name("99999".into())),
            "numbers beyond u16 are names"
        );
        assert_eq!(ParameterKey::Index(7).to_string(), "#7", "index display");
    }

    #[test]
    fn override_moves_index() {
        let registry = ParameterRegistry::new();
        let before = registry.get_by_name("XDHW_TIME").unwrap();
        let changed = registry.override_from_discovery(&[element(2480, "XDHW_TIME", 0, 48)]);
        let after = registry.get_by_name("XDHW_TIME").unwrap();

        assert_eq!(changed, 1, "one parameter should change");
        assert_eq!(after.idx, 2480, "index should be updated");
        assert_eq!(after.format, before.format, "format should be preserved");
        assert_eq!(after.read_only, before.read_only, "flag should be preserved");
        assert_eq!(after.ext_id, "61E1E1FC660023", "external ID should be updated");
        assert_eq!(registry.get_by_index(2475), None, "old index should be gone");
        assert_eq!(
            registry.get_by_index(2480).map(|p| p.name),
            Some("XDHW_TIME".into()),
            "new index should win over the static owner"
        );
        assert!(
            registry.get_by_name("XDHW_ACTIVE").is_some(),
            "shadowed parameter should keep its name"
        );
        assert!(registry.is_shadowed("XDHW_ACTIVE"), "static owner should be shadowed");
        assert!(
            matches!(
                registry.lookup::<Infallible>(&"xdhw_active".into()),
                Err(Error::IndexConflict { ref name, idx: 2480, ref owner })
                    if name == "XDHW_ACTIVE" && owner == "XDHW_TIME"
            ),
            "shadowed parameter should not be addressable"
        );
        assert_eq!(
            registry.lookup::<Infallible>(&"XDHW_TIME".into()).ok().map(|p| p.idx),
            Some(2480),
            "new owner should be addressable"
        );
    }

    #[test]
    fn override_shadows_unreported() {
        let registry = ParameterRegistry::new();

        registry.override_from_discovery(&[element(2475, "GT3_TEMP", -400, 1000)]);

        assert!(
            registry.get_by_name("XDHW_TIME").is_some(),
            "unreported parameter should keep its name"
        );
        assert!(
            matches!(
                registry.lookup::<Infallible>(&"XDHW_TIME".into()),
                Err(Error::IndexConflict { idx: 2475, ref owner, .. }) if owner == "GT3_TEMP"
            ),
            "unreported parameter on a taken index should not be addressable"
        );
        assert_eq!(
            registry.lookup::<Infallible>(&2475u16.into()).ok().map(|p| p.name),
            Some("GT3_TEMP".into()),
            "index should resolve to the discovered parameter"
        );
        assert!(
            matches!(
                registry.lookup::<Infallible>(&"NO_SUCH".into()),
                Err(Error::UnknownParameter(_))
            ),
            "unknown names should still be unknown"
        );
        assert!(!registry.is_shadowed("GT2_TEMP"), "untouched parameter");
    }

    #[test]
    fn override_collision_order() {
        for _ in 0..16 {
            let registry = ParameterRegistry::new();

            registry.override_from_discovery(&[
                element(3000, "ZETA", 0, 1),
                element(3000, "ALPHA", 0, 1),
                element(3001, "BETA", 0, 1),
            ]);

            assert_eq!(
                registry.get_by_index(3000).map(|p| p.name),
                Some("ZETA".into()),
                "first reported element should own a shared index"
            );
            assert!(registry.is_shadowed("ALPHA"), "later element should be shadowed");
        }

        for _ in 0..16 {
            let registry = ParameterRegistry::with_parameters([
                Parameter {
                    name: "FIRST".into(),
                    ..ParameterRegistry::new().get_by_name("XDHW_TIME").unwrap()
                },
                Parameter {
                    name: "SECOND".into(),
                    ..ParameterRegistry::new().get_by_name("XDHW_TIME").unwrap()
                },
            ]);

            registry.override_from_discovery(&[]);

            assert_eq!(
                registry.get_by_index(2475).map(|p| p.name),
                Some("FIRST".into()),
                "static parameters should claim indices in name order"
            );
        }
    }

    #[test]
    fn concurrent_overrides() {
        let registry = ParameterRegistry::new();
        let len = registry.len();

        std::thread::scope(|scope| {
            for thread in 0..8u16 {
                let registry = &registry;

                scope.spawn(move || {
                    for n in 0..8u16 {
                        let idx = 3000 + thread * 8 + n;

                        registry.override_from_discovery(&[element(
                            idx,
                            &format!("NEW_{idx}"),
                            0,
                            1,
                        )]);
                    }
                });
            }
        });

        assert_eq!(registry.len(), len + 64, "no update should be lost");

        for idx in 3000..3064 {
            assert_eq!(
                registry.get_by_index(idx).map(|p| p.name),
                Some(format!("NEW_{idx}")),
                "index {idx} should be registered"
            );
        }
    }

    #[test]
    fn override_adds_unknown() {
        let registry = ParameterRegistry::new();
        let len = registry.len();
        let changed = registry.override_from_discovery(&[element(3000, "NEW_SENSOR", -10, 10)]);
        let param = registry.get_by_index(3000).unwrap();

        assert_eq!(changed, 1, "one parameter should be added");
        assert_eq!(registry.len(), len + 1, "registry should grow");
        assert_eq!(param.name, "NEW_SENSOR", "name should be kept");
        assert_eq!(param.format, ValueFormat::Int, "format should default to int");
        assert!(!param.read_only, "parameter should be writable");
    }

    #[test]
    fn override_unchanged() {
        let registry = ParameterRegistry::new();
        let param = registry.get_by_name("GT3_TEMP").unwrap();
        let same = DiscoveredElement {
            idx: param.idx,
            ext_id: param.ext_id.clone(),
            name: param.name.clone(),
            min: param.min,
            max: param.max,
        };

        assert_eq!(
            registry.override_from_discovery(&[same]),
            0,
            "identical element should not count as a change"
        );
    }

    #[test]
    fn override_consistency() {
        let registry = ParameterRegistry::new();
        let static_names: Vec<_> = registry.parameters().into_iter().map(|p| p.name).collect();

        registry.override_from_discovery(&[
            element(782, "XDHW_TIME", 0, 48),
            element(2475, "GT3_TEMP", -400, 1000),
            element(10, "BRAND_NEW", 0, 1),
        ]);

        for name in &static_names {
            assert!(
                registry.get_by_name(name).is_some(),
                "{name} should still be known"
            );
        }

        for param in registry.parameters() {
            if let Some(owner) = registry.get_by_index(param.idx) {
                assert_eq!(owner.idx, param.idx, "index map should agree with name map");
            }
        }

        assert_eq!(
            registry.get_by_index(782).map(|p| p.name),
            Some("XDHW_TIME".into()),
            "swapped index should resolve to the new owner"
        );
        assert_eq!(
            registry.get_by_index(2475).map(|p| p.name),
            Some("GT3_TEMP".into()),
            "swapped index should resolve to the new owner"
        );
        assert_eq!(
            registry.get_by_name("GT3_TEMP").map(|p| p.format),
            Some(ValueFormat::Temp),
            "format should survive a swap"
        );
    }

    #[test]
    fn parameter_ids() {
        let param = ParameterRegistry::new().get_by_name("XDHW_TIME").unwrap();

        assert_eq!(param.request_id(), 0x0400_3fe0 | (2475 << 14), "request ID");
        assert_eq!(param.response_id(), 0x0c00_3fe0 | (2475 << 14), "response ID");
        assert_eq!(param.encode(5.0), Ok(vec![0x05]), "encoding should be correct");
        assert_eq!(param.decode(&[0x05]), Ok(Value::Integer(5)), "decoding");
    }
}
