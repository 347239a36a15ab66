use std::fmt;

use crate::error::{Error, Result};
use crate::types::cseq::CSeq;
use crate::types::param::Params;
use crate::types::via::ViaHop;

/// A raw header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Expand RFC 3261 compact header names (7.3.3).
fn canonical(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "l" | "L" => "Content-Length",
        "m" | "M" => "Contact",
        "c" | "C" => "Content-Type",
        "e" | "E" => "Content-Encoding",
        "k" | "K" => "Supported",
        "s" | "S" => "Subject",
        other => other,
    }
}

fn same_name(a: &str, b: &str) -> bool {
    canonical(a).eq_ignore_ascii_case(canonical(b))
}

/// Split a header value at top-level commas, ignoring commas inside quotes
/// and angle brackets.
fn split_values(value: &str) -> Vec<&str> {
    let mut values = Vec::new();
    let (mut quoted, mut angle, mut start) = (false, false, 0);
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => angle = true,
            '>' if !quoted => angle = false,
            ',' if !quoted && !angle => {
                values.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    values.push(value[start..].trim());
    values.retain(|v| !v.is_empty());
    values
}

/// Ordered header list with case-insensitive, compact-form aware lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push(Header::new(name, value));
    }

    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(0, Header::new(name, value));
    }

    /// Replace every `name` header with a single one, keeping the position of
    /// the first occurrence.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter().position(|h| same_name(&h.name, name)) {
            Some(first) => {
                self.0[first].value = value;
                let mut index = 0;
                self.0.retain(|h| {
                    let keep = index <= first || !same_name(&h.name, name);
                    index += 1;
                    keep
                });
            }
            None => self.push(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|h| !same_name(&h.name, name));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|h| same_name(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |h| same_name(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Every Via hop in order, across all Via header lines
    pub fn via_hops(&self) -> Result<Vec<ViaHop>> {
        self.get_all("Via")
            .flat_map(split_values)
            .map(|hop| hop.parse::<ViaHop>())
            .collect()
    }

    /// The topmost Via hop
    pub fn top_via(&self) -> Result<ViaHop> {
        let first = self.get("Via").ok_or(Error::MissingHeader("Via"))?;
        split_values(first)
            .into_iter()
            .next()
            .ok_or(Error::MissingHeader("Via"))?
            .parse()
    }

    /// Overwrite the topmost Via hop, keeping any hops that share its line.
    pub fn set_top_via(&mut self, hop: &ViaHop) {
        match self.0.iter().position(|h| same_name(&h.name, "Via")) {
            Some(i) => {
                let mut values: Vec<String> = split_values(&self.0[i].value)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                if values.is_empty() {
                    values.push(hop.to_string());
                } else {
                    values[0] = hop.to_string();
                }
                self.0[i].value = values.join(", ");
            }
            None => self.prepend("Via", hop.to_string()),
        }
    }

    /// Keep only the topmost Via hop
    pub fn retain_top_via(&mut self) -> Result<()> {
        let top = self.top_via()?;
        self.remove("Via");
        self.prepend("Via", top.to_string());
        Ok(())
    }

    pub fn cseq(&self) -> Result<CSeq> {
        self.get("CSeq").ok_or(Error::MissingHeader("CSeq"))?.parse()
    }

    pub fn call_id(&self) -> Result<&str> {
        self.get("Call-ID").ok_or(Error::MissingHeader("Call-ID"))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.get("From").and_then(header_tag)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.get("To").and_then(header_tag)
    }

    /// Declared body length; `Ok(None)` when the header is absent.
    pub fn content_length(&self) -> Result<Option<usize>> {
        match self.get("Content-Length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| Error::invalid_header("Content-Length", format!("'{}' is not a length", value))),
            None => Ok(None),
        }
    }
}

/// `tag` parameter of a name-addr header such as From/To.
fn header_tag(value: &str) -> Option<String> {
    // parameters after the closing '>' belong to the header, not the URI
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value,
    };
    let params = params.split_once(';')?.1;
    Params::parse(params).get("tag").map(str::to_string)
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
