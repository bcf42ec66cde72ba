//! Where the session id lives on the wire: an HTTP header or a query
//! parameter, by configurable name.

use hyper::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Header,
    Query,
}

/// Configured location of the session id.
#[derive(Debug, Clone)]
pub struct SessionLocation {
    pub kind: LocationKind,
    pub name: String,
}

impl SessionLocation {
    pub fn header(name: impl Into<String>) -> Self {
        Self {
            kind: LocationKind::Header,
            name: name.into(),
        }
    }

    pub fn query(name: impl Into<String>) -> Self {
        Self {
            kind: LocationKind::Query,
            name: name.into(),
        }
    }

    /// Extracts the session id from the request, if present and non-empty.
    pub fn locate<T>(&self, req: &Request<T>) -> Option<String> {
        let value = match self.kind {
            LocationKind::Header => req
                .headers()
                .get(self.name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            LocationKind::Query => self.locate_in_query(req.uri().query()?),
        };
        value.filter(|v| !v.is_empty())
    }

    /// Extracts the session id from a raw query string.
    pub fn locate_in_query(&self, query: &str) -> Option<String> {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == self.name.as_str())
            .map(|(_, value)| value.into_owned())
    }

    /// Renders `name=id` for embedding into an advertised endpoint URL.
    pub fn to_query(&self, id: &str) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair(&self.name, id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_in_header() {
        let location = SessionLocation::header("Mcp-Session-Id");
        let req = Request::builder()
            .uri("/mcp")
            .header("Mcp-Session-Id", "abc")
            .body(())
            .unwrap();
        assert_eq!(location.locate(&req), Some("abc".to_string()));

        let missing = Request::builder().uri("/mcp").body(()).unwrap();
        assert_eq!(location.locate(&missing), None);
    }

    #[test]
    fn locates_in_query() {
        let location = SessionLocation::query("session_id");
        let req = Request::builder()
            .uri("/message?session_id=xyz&other=1")
            .body(())
            .unwrap();
        assert_eq!(location.locate(&req), Some("xyz".to_string()));
    }

    #[test]
    fn to_query_escapes_values() {
        let location = SessionLocation::query("session_id");
        assert_eq!(location.to_query("a b"), "session_id=a+b");
    }

    #[test]
    fn empty_value_reads_as_absent() {
        let location = SessionLocation::header("X-Sid");
        let req = Request::builder()
            .uri("/")
            .header("X-Sid", "")
            .body(())
            .unwrap();
        assert_eq!(location.locate(&req), None);
    }
}
