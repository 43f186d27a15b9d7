use std::collections::HashSet;

use crate::error::Error;

/// Hands out string identifiers which are unique among those not yet released.
#[derive(Debug, Default)]
pub struct IdGenerator {
    prefix: Option<String>,
    ids: HashSet<String>,
}

impl IdGenerator {
    /// A generator which uses `prefix1`, `prefix2`, ... when no base is suggested.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ids: HashSet::new(),
        }
    }

    /// Issue an id.
    ///
    /// With a suggestion, issues `suggestion`, `suggestion2`, `suggestion3`, ...
    /// Without one, issues `prefix1`, `prefix2`, ...
    pub fn gen(&mut self, suggested: Option<&str>) -> Result<String, Error> {
        let (base, first) = match (suggested, &self.prefix) {
            (Some(suggested), _) => {
                if !self.ids.contains(suggested) {
                    return Ok(self.issue(suggested.into()));
                }
                (suggested.to_owned(), 2)
            }
            (None, Some(prefix)) => (prefix.clone(), 1),
            (None, None) => {
                return Err(Error::BadUsage(
                    "Cannot generate an id with no prefix or suggested base".into(),
                ))
            }
        };

        let mut i = first;
        loop {
            let id = format!("{base}{i}");
            if !self.ids.contains(&id) {
                return Ok(self.issue(id));
            }
            i += 1;
        }
    }

    fn issue(&mut self, id: String) -> String {
        self.ids.insert(id.clone());
        id
    }

    /// Give an id back. Returns whether it was issued.
    pub fn release(&mut self, id: &str) -> bool {
        self.ids.remove(id)
    }
}

/// Turn a display name into something usable in a URL.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());

    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        slug.push_str("device");
    }

    slug
}
