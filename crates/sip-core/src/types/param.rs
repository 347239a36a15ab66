use std::fmt;

/// Ordered list of `;name[=value]` parameters.
///
/// Names compare case-insensitively; insertion order is kept for
/// serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Params(Vec::new())
    }

    /// Parse the text following the first `;`, e.g. `branch=z9hG4bK1;rport`.
    pub fn parse(s: &str) -> Self {
        let params = s
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((name, value)) => (name.trim().to_string(), Some(value.trim().to_string())),
                None => (p.to_string(), None),
            })
            .collect();
        Params(params)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Value of `name`; `None` when absent or when present as a flag.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).and_then(|i| self.0[i].1.as_deref())
    }

    /// Insert or replace `name`.
    pub fn set(&mut self, name: &str, value: Option<String>) {
        match self.position(name) {
            Some(i) => self.0[i].1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.0 {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_set_remove() {
        let mut params = Params::parse("branch=z9hG4bKabc ; rport;Received=10.0.0.1");
        assert_eq!(params.get("branch"), Some("z9hG4bKabc"));
        assert!(params.contains("rport"));
        assert_eq!(params.get("rport"), None);
        assert_eq!(params.get("received"), Some("10.0.0.1"));

        params.set("rport", Some("5062".to_string()));
        params.remove("received");
        assert_eq!(params.to_string(), ";branch=z9hG4bKabc;rport=5062");
    }
}
