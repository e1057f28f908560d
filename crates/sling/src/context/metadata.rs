use crate::types::message::KeyValue;

/// Per-call headers.
///
/// Header names are case-insensitive and kept in insertion order. A name may
/// carry several values.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct Metadata(Vec<(String, Vec<String>)>);

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` to the values of `key`.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) -> &mut Self {
        let key = key.as_ref().to_ascii_lowercase();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.0.push((key, vec![value])),
        }
        self
    }

    /// Returns the first value of `key`.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn get_all(&self, key: impl AsRef<str>) -> &[String] {
        let key = key.as_ref();
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, values)| values.as_slice())
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: impl AsRef<str>) -> bool {
        !self.get_all(key).is_empty()
    }

    pub fn keys(&self) -> impl '_ + Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds every value of `other` after the values already present.
    pub fn merge(&mut self, other: &Metadata) {
        for KeyValue { key, value } in other.iter() {
            self.insert(key, value);
        }
    }

    /// Flattens the headers into one pair per value.
    pub fn iter(&self) -> impl '_ + Iterator<Item = KeyValue> {
        self.0.iter().flat_map(|(k, v)| {
            v.iter().map(|v| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
        })
    }
}

impl<K: ToString, V: ToString> From<&(K, V)> for KeyValue {
    fn from(value: &(K, V)) -> Self {
        KeyValue {
            key: value.0.to_string(),
            value: value.1.to_string(),
        }
    }
}

impl From<&KeyValue> for KeyValue {
    fn from(value: &KeyValue) -> Self {
        value.clone()
    }
}

impl<T, const N: usize> From<[T; N]> for Metadata
where
    for<'a> &'a T: Into<KeyValue>,
{
    fn from(value: [T; N]) -> Self {
        value.as_slice().into()
    }
}

impl<T> From<&[T]> for Metadata
where
    for<'a> &'a T: Into<KeyValue>,
{
    fn from(pairs: &[T]) -> Self {
        let mut metadata = Metadata::default();
        for kv in pairs {
            let KeyValue { key, value } = kv.into();
            metadata.insert(key, value);
        }
        metadata
    }
}

impl From<Option<Metadata>> for Metadata {
    fn from(metadata: Option<Metadata>) -> Self {
        metadata.unwrap_or_default()
    }
}

impl From<Metadata> for Vec<KeyValue> {
    fn from(metadata: Metadata) -> Self {
        metadata.iter().collect()
    }
}
