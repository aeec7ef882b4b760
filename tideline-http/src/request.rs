//! Request-side types: header multimap, version, parsed request head.

use crate::body::BodyReader;

/// HTTP version of a parsed message. Only 1.0 and 1.1 are accepted;
/// anything else is a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Ordered header list preserving duplicates.
///
/// Lookup is case-insensitive on the name (field names are tokens, so
/// ASCII case folding suffices). Insertion order is wire order; `get`
/// returns the first match and `get_all` walks every occurrence.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Append a header, keeping any existing occurrences.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether any value for `name`, split on commas, contains `token`
    /// (case-insensitive). Used for `Connection: keep-alive, upgrade`
    /// style list-valued headers.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parsed request line plus headers. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

impl RequestHead {
    /// Keep-alive decision: the version default (1.1 on, 1.0 off)
    /// flipped by an explicit `Connection: close` / `keep-alive` token.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::Http11 => !self.headers.has_token("connection", "close"),
            Version::Http10 => self.headers.has_token("connection", "keep-alive"),
        }
    }

    /// Whether the request asks to switch protocols.
    pub fn wants_upgrade(&self) -> bool {
        self.headers.has_token("connection", "upgrade")
    }

    /// Whether the client expects an interim `100 Continue` before
    /// sending the body.
    pub fn expects_continue(&self) -> bool {
        self.headers
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }
}

/// A request handed to an [`HttpService`](crate::HttpService): parsed head
/// plus a streaming body reader bounded by the negotiated framing.
pub struct Request {
    pub head: RequestHead,
    pub body: BodyReader,
}

impl Request {
    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn target(&self) -> &str {
        &self.head.target
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(version: Version, headers: &[(&str, &str)]) -> RequestHead {
        let mut h = Headers::new();
        for (n, v) in headers {
            h.push(*n, *v);
        }
        RequestHead {
            method: "GET".to_string(),
            target: "/".to_string(),
            version,
            headers: h,
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.push("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("content-length"), None);
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let mut h = Headers::new();
        h.push("Set-Cookie", "a=1");
        h.push("X-Other", "x");
        h.push("Set-Cookie", "b=2");
        assert_eq!(h.get("set-cookie"), Some("a=1"));
        let all: Vec<&str> = h.get_all("set-cookie").collect();
        assert_eq!(all, vec!["a=1", "b=2"]);
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn token_lists_split_on_commas() {
        let mut h = Headers::new();
        h.push("Connection", "keep-alive, Upgrade");
        assert!(h.has_token("connection", "upgrade"));
        assert!(h.has_token("connection", "keep-alive"));
        assert!(!h.has_token("connection", "close"));
    }

    #[test]
    fn keep_alive_defaults_per_version() {
        assert!(head(Version::Http11, &[]).is_keep_alive());
        assert!(!head(Version::Http10, &[]).is_keep_alive());
    }

    #[test]
    fn explicit_connection_header_flips_default() {
        assert!(!head(Version::Http11, &[("Connection", "close")]).is_keep_alive());
        assert!(head(Version::Http10, &[("Connection", "keep-alive")]).is_keep_alive());
    }

    #[test]
    fn expect_continue_detection() {
        assert!(head(Version::Http11, &[("Expect", "100-Continue")]).expects_continue());
        assert!(!head(Version::Http11, &[]).expects_continue());
    }
}
