use serde::{Deserialize, Serialize};

/// Ordered multi-value header map. Names keep the casing they were first seen
/// with, lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|i| self.entries[i].1.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(i) => &self.entries[i].1,
            None => &[],
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replaces all values of `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(i) => self.entries[i].1 = vec![value.into()],
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.position(&name) {
            Some(i) => self.entries[i].1.push(value.into()),
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    /// Iterates `(name, value)` pairs, one per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, values)| values.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.append(k, v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::Headers;

    #[test]
    fn test_case_insensitive_multi_values() {
        let mut headers: Headers = [("Set-Cookie", "a=1"), ("Host", "example.com")]
            .into_iter()
            .collect();
        headers.append("set-cookie", "b=2");

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(headers.get_all("set-cookie"), ["a=1", "b=2"]);
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                ("Set-Cookie", "a=1"),
                ("Set-Cookie", "b=2"),
                ("Host", "example.com")
            ]
        );

        headers.insert("set-cookie", "c=3");
        assert_eq!(headers.get_all("Set-Cookie"), ["c=3"]);

        assert_eq!(headers.remove("host"), Some(vec!["example.com".to_string()]));
        assert!(!headers.contains("Host"));
        assert!(headers.get_all("host").is_empty());
    }
}
