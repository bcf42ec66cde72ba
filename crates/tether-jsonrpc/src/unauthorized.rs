use std::fmt;

/// Transport-level authorization failure carrying the HTTP status and body.
///
/// Clients surface this instead of a generic status error so callers can
/// trigger a re-authentication flow.
#[derive(Debug, Clone)]
pub struct UnauthorizedError {
    pub status: u16,
    pub body: String,
}

impl UnauthorizedError {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

impl fmt::Display for UnauthorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.body.is_empty() {
            write!(f, "unauthorized (status {})", self.status)
        } else {
            write!(f, "unauthorized (status {}): {}", self.status, self.body)
        }
    }
}

impl std::error::Error for UnauthorizedError {}

/// Returns true when `err` is, or transitively wraps, an
/// [`UnauthorizedError`].
pub fn is_unauthorized(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<UnauthorizedError>() {
            return true;
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Outer(UnauthorizedError);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "outer: {}", self.0)
        }
    }

    impl std::error::Error for Outer {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn display_includes_body_when_present() {
        let with_body = UnauthorizedError::new(401, "token expired");
        assert_eq!(with_body.to_string(), "unauthorized (status 401): token expired");

        let bare = UnauthorizedError::new(401, "");
        assert_eq!(bare.to_string(), "unauthorized (status 401)");
    }

    #[test]
    fn detects_wrapped_unauthorized() {
        let outer = Outer(UnauthorizedError::new(401, ""));
        assert!(is_unauthorized(&outer));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "nope");
        assert!(!is_unauthorized(&other));
    }
}
