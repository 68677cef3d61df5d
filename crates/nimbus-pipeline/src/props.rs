//! Element property introspection and string coercion.
//!
//! Component configuration carries properties as strings; each element
//! class publishes the specs of the properties it accepts, and the
//! configured string is coerced to the declared type before it reaches
//! the element.

use std::collections::BTreeMap;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKind {
    Bool,
    Int,
    Float,
    Str,
    /// Enumeration set by integer value; the list is the accepted
    /// values.
    Enum(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertySpec {
    pub name: &'static str,
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PropertySpec {
    pub fn new(name: &'static str, kind: PropertyKind) -> Self {
        Self { name, kind }
    }

    /// Coerce a configured string to this property's type.
    ///
    /// Booleans accept exactly `True` and `False` (case-sensitive).
    /// Enums are set by integer value and reject values outside the
    /// declared set.
    pub fn coerce(&self, element: &str, raw: &str) -> PipelineResult<PropertyValue> {
        let fail = |reason: String| PipelineError::Property {
            element: element.to_string(),
            property: self.name.to_string(),
            reason,
        };
        match &self.kind {
            PropertyKind::Bool => match raw {
                "True" => Ok(PropertyValue::Bool(true)),
                "False" => Ok(PropertyValue::Bool(false)),
                other => Err(fail(format!("not a boolean: {other:?}"))),
            },
            PropertyKind::Int => raw
                .parse::<i64>()
                .map(PropertyValue::Int)
                .map_err(|e| fail(format!("not an integer: {e}"))),
            PropertyKind::Float => raw
                .parse::<f64>()
                .map(PropertyValue::Float)
                .map_err(|e| fail(format!("not a float: {e}"))),
            PropertyKind::Str => Ok(PropertyValue::Str(raw.to_string())),
            PropertyKind::Enum(accepted) => {
                let value = raw
                    .parse::<i64>()
                    .map_err(|e| fail(format!("enum takes an integer value: {e}")))?;
                if accepted.contains(&value) {
                    Ok(PropertyValue::Int(value))
                } else {
                    Err(fail(format!("{value} is not one of {accepted:?}")))
                }
            }
        }
    }
}

/// The property table of one element class.
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    specs: BTreeMap<&'static str, PropertySpec>,
}

impl PropertyTable {
    pub fn new(specs: impl IntoIterator<Item = PropertySpec>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.name, s)).collect(),
        }
    }

    pub fn spec(&self, name: &str) -> Option<&PropertySpec> {
        self.specs.get(name)
    }

    /// Coerce a full property map; unknown property names fail.
    pub fn coerce_all(
        &self,
        element: &str,
        raw: &BTreeMap<String, String>,
    ) -> PipelineResult<BTreeMap<String, PropertyValue>> {
        let mut out = BTreeMap::new();
        for (name, value) in raw {
            let spec = self.spec(name).ok_or_else(|| PipelineError::Property {
                element: element.to_string(),
                property: name.clone(),
                reason: "no such property".to_string(),
            })?;
            out.insert(name.clone(), spec.coerce(element, value)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bool_spec() -> PropertySpec {
        PropertySpec::new("sync", PropertyKind::Bool)
    }

    #[test]
    fn booleans_are_case_sensitive() {
        let spec = bool_spec();
        assert_eq!(
            spec.coerce("sink", "True").unwrap(),
            PropertyValue::Bool(true)
        );
        assert_eq!(
            spec.coerce("sink", "False").unwrap(),
            PropertyValue::Bool(false)
        );
        assert!(spec.coerce("sink", "true").is_err());
        assert!(spec.coerce("sink", "TRUE").is_err());
    }

    #[test]
    fn numbers_parse_or_fail() {
        let int = PropertySpec::new("port", PropertyKind::Int);
        assert_eq!(int.coerce("src", "8080").unwrap(), PropertyValue::Int(8080));
        assert!(int.coerce("src", "8080.5").is_err());

        let float = PropertySpec::new("volume", PropertyKind::Float);
        assert_eq!(
            float.coerce("src", "0.5").unwrap(),
            PropertyValue::Float(0.5)
        );
    }

    #[test]
    fn enums_take_declared_integers_only() {
        let spec = PropertySpec::new("method", PropertyKind::Enum(vec![0, 1, 2]));
        assert_eq!(spec.coerce("scaler", "1").unwrap(), PropertyValue::Int(1));
        assert!(spec.coerce("scaler", "7").is_err());
        assert!(spec.coerce("scaler", "one").is_err());
    }

    #[test]
    fn unknown_property_fails_whole_map() {
        let table = PropertyTable::new([bool_spec()]);
        let mut raw = BTreeMap::new();
        raw.insert("sync".to_string(), "True".to_string());
        raw.insert("bogus".to_string(), "1".to_string());
        assert!(table.coerce_all("sink", &raw).is_err());
    }
}
