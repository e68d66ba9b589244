//! Dataset name handling.
//!
//! ZFS dataset names are `/`-separated component paths, with an optional
//! `@snapshot` suffix on the final component. Each component is validated
//! on its own; the separators never appear inside a component.

use crate::engine::Error;

/// Longest accepted component, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Validates a single dataset name component.
///
/// Components may contain ASCII letters, digits, `-`, `_`, `.`, `:` and
/// space. Separators (`/`, `@`) are rejected here; callers split on them
/// first.
pub fn namecheck(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::DatasetName {
            name: name.to_string(),
            reason: "name cannot be empty".to_string(),
        });
    }

    if name.len() > MAX_NAME_LEN {
        return Err(Error::DatasetName {
            name: name.to_string(),
            reason: "name too long".to_string(),
        });
    }

    for c in name.chars() {
        if !c.is_ascii_alphanumeric()
            && c != '-'
            && c != '_'
            && c != '.'
            && c != ':'
            && c != ' '
        {
            return Err(Error::DatasetName {
                name: name.to_string(),
                reason: format!("invalid character '{}' in name", c),
            });
        }
    }

    Ok(())
}

/// Get the pool component of a full dataset name: everything before the
/// first `/` or `@`.
pub fn pool_of_name(name: &str) -> &str {
    match name.find(|c| c == '/' || c == '@') {
        Some(pos) => &name[..pos],
        None => name,
    }
}

/// Split a name on the first `@`, yielding the dataset part and the
/// snapshot part (if any). `"tank/fs@snap"` becomes `("tank/fs",
/// Some("snap"))`; a trailing `@` yields `Some("")`.
pub fn split_snapshot(name: &str) -> (&str, Option<&str>) {
    match name.find('@') {
        Some(pos) => (&name[..pos], Some(&name[pos + 1..])),
        None => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namecheck_accepts_valid_components() {
        assert!(namecheck("tank").is_ok());
        assert!(namecheck("data-set_1").is_ok());
        assert!(namecheck("with space").is_ok());
        assert!(namecheck("a:b.c").is_ok());
        assert!(namecheck(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn test_namecheck_rejects_bad_components() {
        assert!(matches!(namecheck(""), Err(Error::DatasetName { .. })));
        assert!(matches!(
            namecheck(&"x".repeat(256)),
            Err(Error::DatasetName { .. })
        ));
        assert!(matches!(namecheck("a/b"), Err(Error::DatasetName { .. })));
        assert!(matches!(namecheck("a@b"), Err(Error::DatasetName { .. })));
        assert!(matches!(namecheck("a%b"), Err(Error::DatasetName { .. })));
    }

    #[test]
    fn test_pool_of_name() {
        assert_eq!(pool_of_name("tank"), "tank");
        assert_eq!(pool_of_name("tank/fs/sub"), "tank");
        assert_eq!(pool_of_name("tank@snap"), "tank");
        assert_eq!(pool_of_name("tank/fs@snap"), "tank");
    }

    #[test]
    fn test_split_snapshot() {
        assert_eq!(split_snapshot("tank/fs"), ("tank/fs", None));
        assert_eq!(split_snapshot("tank/fs@s1"), ("tank/fs", Some("s1")));
        assert_eq!(split_snapshot("tank/fs@"), ("tank/fs", Some("")));
        assert_eq!(split_snapshot("@s"), ("", Some("s")));
    }
}
