//! Serde helpers for cluster files.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::de::{self, value::MapAccessDeserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use void::Void;

/// Parses either a bare string (through `FromStr`) or a mapping (through `Deserialize`).
/// https://serde.rs/string-or-struct.html
pub fn string_or_mapping<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct StringOrMapping<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrMapping<T>
    where
        T: Deserialize<'de> + FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a hostname or a mapping with a 'hostname' key")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            match T::from_str(value) {
                Ok(parsed) => Ok(parsed),
                Err(void) => void::unreachable(void),
            }
        }

        fn visit_map<M>(self, map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            Deserialize::deserialize(MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(StringOrMapping(PhantomData))
}

/// A list of scalars that may also be written as a single scalar.
///
/// `slots: 8`, `slots: "8"` and `slots: [8]` all read as `["8"]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ScalarList(pub Vec<String>);

/// A string, number or boolean, kept as its string form.
struct Scalar(String);

struct ScalarVisitor;

impl<'de> Visitor<'de> for ScalarVisitor {
    type Value = Scalar;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string, number or boolean")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
        Ok(Scalar(value.to_owned()))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
        Ok(Scalar(value.to_string()))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
        Ok(Scalar(value.to_string()))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
        Ok(Scalar(value.to_string()))
    }

    fn visit_bool<E: de::Error>(self, value: bool) -> Result<Self::Value, E> {
        Ok(Scalar(value.to_string()))
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }
}

impl<'de> Deserialize<'de> for ScalarList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OneOrMany;

        impl<'de> Visitor<'de> for OneOrMany {
            type Value = ScalarList;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a scalar or a list of scalars")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                ScalarVisitor.visit_str(value).map(|s| ScalarList(vec![s.0]))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                ScalarVisitor.visit_i64(value).map(|s| ScalarList(vec![s.0]))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                ScalarVisitor.visit_u64(value).map(|s| ScalarList(vec![s.0]))
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
                ScalarVisitor.visit_f64(value).map(|s| ScalarList(vec![s.0]))
            }

            fn visit_bool<E: de::Error>(self, value: bool) -> Result<Self::Value, E> {
                ScalarVisitor.visit_bool(value).map(|s| ScalarList(vec![s.0]))
            }

            fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
            where
                S: SeqAccess<'de>,
            {
                let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(Scalar(value)) = seq.next_element()? {
                    values.push(value);
                }
                Ok(ScalarList(values))
            }
        }

        deserializer.deserialize_any(OneOrMany)
    }
}

#[cfg(test)]
mod tests {
    use super::ScalarList;

    #[test]
    fn scalar_reads_as_single_item() {
        let list: ScalarList = serde_yaml::from_str("8").unwrap();
        assert_eq!(list.0, vec!["8"]);
        let list: ScalarList = serde_yaml::from_str("node1").unwrap();
        assert_eq!(list.0, vec!["node1"]);
    }

    #[test]
    fn mixed_list_reads_as_strings() {
        let list: ScalarList = serde_yaml::from_str("[a, 2, true]").unwrap();
        assert_eq!(list.0, vec!["a", "2", "true"]);
    }

    #[test]
    fn nested_lists_are_rejected() {
        assert!(serde_yaml::from_str::<ScalarList>("[[a]]").is_err());
    }
}
