use crate::{FieldKind, Server};
use regex::Regex;

/// Membership rule shared by [`Pool::list`](crate::Pool::list) and
/// [`Pool::filter`](crate::Pool::filter).
///
/// A server matches when the lowercased `field` value contains the lowercased
/// `pattern`, or else when its name matches `regex`. Empty inputs never match
/// and an invalid regex disables only the regex branch.
pub(crate) struct Matcher {
    field: FieldKind,
    pattern: String,
    regex: Option<Regex>,
}

impl Matcher {
    pub(crate) fn new(field: FieldKind, pattern: &str, regex: &str) -> Self {
        let regex = if regex.is_empty() {
            None
        } else {
            match Regex::new(regex) {
                Ok(re) => Some(re),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Ignoring invalid server filter regex {regex:?}: {_e}");
                    None
                }
            }
        };

        Self {
            field,
            pattern: pattern.to_lowercase(),
            regex,
        }
    }

    /// `true` when no server can ever match.
    pub(crate) fn is_void(&self) -> bool {
        self.pattern.is_empty() && self.regex.is_none()
    }

    pub(crate) fn matches<H: Send + 'static>(&self, server: &dyn Server<H>) -> bool {
        if !self.pattern.is_empty()
            && self
                .field
                .value_of(server)
                .to_lowercase()
                .contains(&self.pattern)
        {
            return true;
        }

        self.regex
            .as_ref()
            .is_some_and(|re| re.is_match(&server.name()))
    }
}
