//! Keyword values carried alongside a frame.
//!
//! A header is an ordered keyword map filled from the file by
//! [`read_image`](super::read_image) and rewritten in place as a frame is
//! corrected.

/// Typed keyword value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// Integer value.
    Integer(i64),
    /// Real value.
    Float(f64),
    /// Character string.
    Text(String),
}

impl HeaderValue {
    /// Returns the value as a float if it is numeric, or a string holding a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Integer(v) => Some(*v as f64),
            HeaderValue::Float(v) => Some(*v),
            HeaderValue::Text(s) => parse_number(s.trim()),
        }
    }

    /// Returns the value as an integer if it is integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(v) => Some(*v),
            other => {
                let v = other.as_f64()?;
                if v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                    Some(v as i64)
                } else {
                    None
                }
            }
        }
    }

    /// Narrows a real read from a file to an integer when it has no fraction.
    pub(crate) fn from_real(v: f64) -> Self {
        match HeaderValue::Float(v).as_i64() {
            Some(i) => HeaderValue::Integer(i),
            None => HeaderValue::Float(v),
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Integer(v)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Text(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Text(v)
    }
}

/// Ordered keyword → value map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    entries: Vec<(String, HeaderValue)>,
}

impl Header {
    /// Creates an empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a keyword.
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns a keyword's value as a float.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(HeaderValue::as_f64)
    }

    /// Returns a keyword's value as an integer.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(HeaderValue::as_i64)
    }

    /// Returns true if the keyword is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets a keyword, replacing its value in place or appending it.
    pub fn set(&mut self, key: &str, value: impl Into<HeaderValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Removes a keyword.
    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// Iterates over keywords in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of keywords.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the header holds no keywords.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, HeaderValue)> for Header {
    fn from_iter<I: IntoIterator<Item = (String, HeaderValue)>>(iter: I) -> Self {
        let mut header = Header::new();
        for (key, value) in iter {
            header.set(&key, value);
        }
        header
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.replace(['D', 'd'], "E").parse::<f64>().ok()
}
