//! Per-page element handle registry.
//!
//! A `find`-style call atomically replaces the whole table: `@eN` tokens
//! never survive the next `find`/`find-all`/`map` on the same page, but they
//! do survive arbitrary other commands until then.

use std::sync::RwLock;

use crate::error::{EngineError, Result};

/// Upper bound of refs a single find call may record.
pub const MAX_HANDLES: usize = 1024;

/// One recorded element: the BiDi `sharedId` captured at find time plus the
/// originating selector spec and result index used to re-resolve the element
/// when the `sharedId` goes stale within the same document.
#[derive(Debug, Clone)]
pub struct HandleEntry {
    pub shared_id: Option<String>,
    /// The selector spec of the find call that produced this entry.
    pub spec: serde_json::Value,
    /// Position of this element within that call's results.
    pub index: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: Vec<HandleEntry>,
    /// Page URL observed when the table was populated.
    url: String,
}

/// The per page handle table. Reads take a short read lock, `find`-style
/// replacement an exclusive one.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    inner: RwLock<Inner>,
}

impl HandleRegistry {
    /// Swap in the results of a fresh find call, invalidating every prior
    /// token. Entries beyond [`MAX_HANDLES`] are dropped.
    pub fn replace_all(&self, mut entries: Vec<HandleEntry>, url: String) {
        entries.truncate(MAX_HANDLES);
        let mut inner = self.inner.write().expect("handle registry poisoned");
        inner.entries = entries;
        inner.url = url;
    }

    /// Drop every entry, e.g. after a recovery relaunch.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("handle registry poisoned");
        inner.entries.clear();
        inner.url.clear();
    }

    /// Resolve a `@eN` token into its entry plus the URL the table was
    /// captured at.
    pub fn lookup(&self, token: &str) -> Result<(HandleEntry, String)> {
        let index = parse_token(token).ok_or_else(|| {
            EngineError::invalid(format!("{token:?} is not an element ref of the form @eN"))
        })?;
        let inner = self.inner.read().expect("handle registry poisoned");
        match inner.entries.get(index) {
            Some(entry) => Ok((entry.clone(), inner.url.clone())),
            None => Err(EngineError::StaleHandle {
                handle: token.to_string(),
            }),
        }
    }

    /// Record a re-resolved `sharedId` for a token.
    pub fn update_shared_id(&self, token: &str, shared_id: String) {
        if let Some(index) = parse_token(token) {
            let mut inner = self.inner.write().expect("handle registry poisoned");
            if let Some(entry) = inner.entries.get_mut(index) {
                entry.shared_id = Some(shared_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("handle registry poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a target string is an element ref rather than a selector.
pub fn is_token(s: &str) -> bool {
    parse_token(s).is_some()
}

/// `@e3` → index 2. Tokens are 1-based.
pub fn parse_token(s: &str) -> Option<usize> {
    let digits = s.strip_prefix("@e")?;
    let n: usize = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    Some(n - 1)
}

/// Index 2 → `@e3`.
pub fn token_for(index: usize) -> String {
    format!("@e{}", index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> HandleEntry {
        HandleEntry {
            shared_id: Some(id.to_string()),
            spec: serde_json::json!({"css": "a"}),
            index: 0,
        }
    }

    #[test]
    fn tokens_are_one_based() {
        assert_eq!(parse_token("@e1"), Some(0));
        assert_eq!(parse_token("@e12"), Some(11));
        assert_eq!(parse_token("@e0"), None);
        assert_eq!(parse_token("e1"), None);
        assert_eq!(parse_token("@ex"), None);
        assert_eq!(token_for(0), "@e1");
    }

    #[test]
    fn find_replaces_the_table() {
        let registry = HandleRegistry::default();
        registry.replace_all(vec![entry("a"), entry("b")], "https://one.test/".into());
        assert_eq!(registry.len(), 2);

        let (first, url) = registry.lookup("@e1").unwrap();
        assert_eq!(first.shared_id.as_deref(), Some("a"));
        assert_eq!(url, "https://one.test/");

        registry.replace_all(vec![entry("c")], "https://one.test/".into());
        assert_eq!(registry.len(), 1);
        let (first, _) = registry.lookup("@e1").unwrap();
        assert_eq!(first.shared_id.as_deref(), Some("c"));
        assert!(matches!(
            registry.lookup("@e2"),
            Err(EngineError::StaleHandle { .. })
        ));
    }

    #[test]
    fn table_is_bounded() {
        let registry = HandleRegistry::default();
        let entries = (0..MAX_HANDLES + 10).map(|_| entry("x")).collect();
        registry.replace_all(entries, String::new());
        assert_eq!(registry.len(), MAX_HANDLES);
    }

    #[test]
    fn malformed_tokens_are_invalid_arguments() {
        let registry = HandleRegistry::default();
        assert!(matches!(
            registry.lookup("@elephant"),
            Err(EngineError::InvalidArgument { .. })
        ));
    }
}
