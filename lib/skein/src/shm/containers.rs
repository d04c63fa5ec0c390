use crate::shm::proto::Rcode;
use serde_json::{Map, Value};
use std::convert::TryFrom;

/// Type tags of the shared-state containers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ContainerType {
    Str = 0x01,
    Int = 0x02,
    Float = 0x03,
    Bool = 0x04,

    Set = 0x11,
    List = 0x13,

    Dict = 0x21,
}

impl TryFrom<u8> for ContainerType {
    type Error = u8;

    fn try_from(byte: u8) -> Result<ContainerType, u8> {
        match byte {
            0x01 => Ok(ContainerType::Str),
            0x02 => Ok(ContainerType::Int),
            0x03 => Ok(ContainerType::Float),
            0x04 => Ok(ContainerType::Bool),
            0x11 => Ok(ContainerType::Set),
            0x13 => Ok(ContainerType::List),
            0x21 => Ok(ContainerType::Dict),
            other => Err(other),
        }
    }
}

impl ContainerType {
    #[inline]
    pub fn is_single_value(self) -> bool {
        match self {
            ContainerType::Str | ContainerType::Int | ContainerType::Float | ContainerType::Bool => true,
            _ => false,
        }
    }
}

/// A typed shared-state container. The single owner is the server process;
/// clients only ever see the JSON projection.
#[derive(Debug, Clone, PartialEq)]
pub enum Container {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Set(Vec<Value>),
    List(Vec<Value>),
    Dict(Map<String, Value>),
}

impl Container {
    #[inline]
    pub fn kind(&self) -> ContainerType {
        match self {
            Container::Str(_) => ContainerType::Str,
            Container::Int(_) => ContainerType::Int,
            Container::Float(_) => ContainerType::Float,
            Container::Bool(_) => ContainerType::Bool,
            Container::Set(_) => ContainerType::Set,
            Container::List(_) => ContainerType::List,
            Container::Dict(_) => ContainerType::Dict,
        }
    }

    pub fn empty(kind: ContainerType) -> Container {
        match kind {
            ContainerType::Str => Container::Str(String::new()),
            ContainerType::Int => Container::Int(0),
            ContainerType::Float => Container::Float(0.0),
            ContainerType::Bool => Container::Bool(false),
            ContainerType::Set => Container::Set(Vec::new()),
            ContainerType::List => Container::List(Vec::new()),
            ContainerType::Dict => Container::Dict(Map::new()),
        }
    }

    /// Builds a container of the requested type from an optional initial
    /// value. A value whose JSON type does not fit the container type is a
    /// type error.
    pub fn from_initial(kind: ContainerType, value: Option<Value>) -> Result<Container, Rcode> {
        let value = match value {
            Some(Value::Null) | None => return Ok(Container::empty(kind)),
            Some(value) => value,
        };

        match (kind, value) {
            (ContainerType::Str, Value::String(unit)) => Ok(Container::Str(unit)),
            (ContainerType::Int, Value::Number(number)) => match number.as_i64() {
                Some(unit) => Ok(Container::Int(unit)),
                None => Err(Rcode::TypeError),
            },
            (ContainerType::Float, Value::Number(number)) => match number.as_f64() {
                Some(unit) => Ok(Container::Float(unit)),
                None => Err(Rcode::TypeError),
            },
            (ContainerType::Bool, Value::Bool(unit)) => Ok(Container::Bool(unit)),
            (ContainerType::Set, Value::Array(units)) => {
                let mut set = Container::Set(Vec::new());
                set.add(Value::Array(units))?;
                Ok(set)
            }
            (ContainerType::List, Value::Array(units)) => Ok(Container::List(units)),
            (ContainerType::Dict, Value::Object(map)) => Ok(Container::Dict(map)),
            _ => Err(Rcode::TypeError),
        }
    }

    /// JSON projection of the current value. Sets serialize as arrays.
    pub fn to_value(&self) -> Value {
        match self {
            Container::Str(unit) => Value::String(unit.clone()),
            Container::Int(unit) => Value::from(*unit),
            Container::Float(unit) => Value::from(*unit),
            Container::Bool(unit) => Value::Bool(*unit),
            Container::Set(units) | Container::List(units) => Value::Array(units.clone()),
            Container::Dict(map) => Value::Object(map.clone()),
        }
    }

    /// Replaces the value of a single-value container.
    pub fn set(&mut self, value: Value) -> Result<(), Rcode> {
        if !self.kind().is_single_value() {
            return Err(Rcode::TypeError);
        }

        *self = Container::from_initial(self.kind(), Some(value))?;
        Ok(())
    }

    /// Inserts into a collection container: an array of values for sets and
    /// lists (set insertion deduplicates), an object for dicts.
    pub fn add(&mut self, value: Value) -> Result<(), Rcode> {
        match (self, value) {
            (Container::Set(units), Value::Array(incoming)) => {
                for unit in incoming {
                    if !units.contains(&unit) {
                        units.push(unit);
                    }
                }
                Ok(())
            }
            (Container::List(units), Value::Array(incoming)) => {
                units.extend(incoming);
                Ok(())
            }
            (Container::Dict(map), Value::Object(incoming)) => {
                map.extend(incoming);
                Ok(())
            }
            _ => Err(Rcode::TypeError),
        }
    }

    /// Fetches a single dict entry; absent entries read as null.
    pub fn get(&self, value_key: &str) -> Result<Value, Rcode> {
        match self {
            Container::Dict(map) => Ok(map.get(value_key).cloned().unwrap_or(Value::Null)),
            _ => Err(Rcode::TypeError),
        }
    }

    /// Removes values from a collection container: for sets and lists the
    /// values themselves, for dicts the named keys. Values that are not
    /// present are ignored.
    pub fn remove(&mut self, values: Value) -> Result<(), Rcode> {
        let values = match values {
            Value::Array(units) => units,
            _ => return Err(Rcode::TypeError),
        };

        match self {
            Container::Set(units) | Container::List(units) => {
                units.retain(|unit| !values.contains(unit));
                Ok(())
            }
            Container::Dict(map) => {
                for value in values {
                    if let Value::String(key) = value {
                        map.remove(&key);
                    }
                }
                Ok(())
            }
            _ => Err(Rcode::TypeError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_with_mismatched_value_is_type_error() {
        let result = Container::from_initial(ContainerType::Dict, Some(json!("a")));
        assert_eq!(result.unwrap_err(), Rcode::TypeError);

        let result = Container::from_initial(ContainerType::Int, Some(json!("12")));
        assert_eq!(result.unwrap_err(), Rcode::TypeError);
    }

    #[test]
    fn test_create_without_value_is_empty() {
        let container = Container::from_initial(ContainerType::List, None).unwrap();
        assert_eq!(container.to_value(), json!([]));
    }

    #[test]
    fn test_set_only_for_single_value_types() {
        let mut container = Container::from_initial(ContainerType::Int, Some(json!(1))).unwrap();
        container.set(json!(5)).unwrap();
        assert_eq!(container.to_value(), json!(5));

        let mut list = Container::empty(ContainerType::List);
        assert_eq!(list.set(json!([1])).unwrap_err(), Rcode::TypeError);
    }

    #[test]
    fn test_set_insertion_deduplicates() {
        let mut set = Container::empty(ContainerType::Set);

        set.add(json!([1, 2])).unwrap();
        set.add(json!([2, 3])).unwrap();

        assert_eq!(set.to_value(), json!([1, 2, 3]));
    }

    #[test]
    fn test_dict_add_get_remove() {
        let mut dict = Container::empty(ContainerType::Dict);

        dict.add(json!({"a": 1, "b": 2})).unwrap();
        assert_eq!(dict.get("a").unwrap(), json!(1));
        assert_eq!(dict.get("missing").unwrap(), Value::Null);

        dict.remove(json!(["a"])).unwrap();
        assert_eq!(dict.to_value(), json!({"b": 2}));
    }

    #[test]
    fn test_add_scalar_to_collection_is_type_error() {
        let mut list = Container::empty(ContainerType::List);
        assert_eq!(list.add(json!(1)).unwrap_err(), Rcode::TypeError);

        let mut dict = Container::empty(ContainerType::Dict);
        assert_eq!(dict.add(json!([1])).unwrap_err(), Rcode::TypeError);
    }

    #[test]
    fn test_remove_ignores_missing_values() {
        let mut list = Container::from_initial(ContainerType::List, Some(json!([1, 2]))).unwrap();

        list.remove(json!([2, 99])).unwrap();

        assert_eq!(list.to_value(), json!([1]));
    }
}
