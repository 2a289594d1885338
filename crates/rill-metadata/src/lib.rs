// Ordered key/value metadata attached to connections and producer streams.
//
// The wire form is `k:v` per entry, entries joined by `\n`, no trailing
// newline. Keys and values therefore must not contain `:` or `\n`.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("metadata key or value contains ':' or newline")]
    InvalidKeyOrValue,
    #[error("invalid metadata format")]
    InvalidFormat,
}

/// Insertion-ordered string map.
///
/// ```
/// use rill_metadata::Md;
///
/// let mut md = Md::new();
/// md.set("abc", "def").expect("set");
/// assert_eq!(md.get("abc"), Some("def"));
/// assert_eq!(md.encode(), b"abc:def");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Md {
    entries: Vec<(String, String)>,
}

impl Md {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace an entry; replacement keeps the original position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        if !valid_component(&key) || !valid_component(&value) {
            return Err(Error::InvalidKeyOrValue);
        }
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(b'\n');
            }
            out.extend_from_slice(key.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
        }
        out
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let mut md = Md::new();
        if input.is_empty() {
            return Ok(md);
        }
        let text = std::str::from_utf8(input).map_err(|_| Error::InvalidFormat)?;
        for line in text.split('\n') {
            let (key, value) = line.split_once(':').ok_or(Error::InvalidFormat)?;
            md.set(key, value)?;
        }
        Ok(md)
    }
}

fn valid_component(value: &str) -> bool {
    !value.contains(':') && !value.contains('\n')
}
