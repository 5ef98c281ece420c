//! Best-effort mapping from a free-text salesperson name to a chat member.

use crate::amount::ascii_digit;
use crate::{MemberDirectory, ResolvedIdentity};

/// Drops a trailing run of digits (multi-account suffixes such as `张三2`)
/// together with the whitespace around it.
pub fn clean_display_name(raw_name: &str) -> &str {
    raw_name
        .trim_end()
        .trim_end_matches(|c: char| ascii_digit(c).is_some())
        .trim()
}

/// Resolves `raw_name` against `directory`, first match wins:
/// exact raw name, exact cleaned name, then substring containment either way.
///
/// An unresolved name is not an error; the caller addresses the cleaned name
/// as plain text instead.
pub fn resolve_identity(raw_name: &str, directory: &MemberDirectory) -> ResolvedIdentity {
    let clean_name = clean_display_name(raw_name);
    let resolved = |handle: &String| ResolvedIdentity {
        canonical_name: clean_name.to_string(),
        handle: Some(handle.clone()),
    };

    if let Some(handle) = directory.get(raw_name) {
        return resolved(handle);
    }
    if let Some(handle) = directory.get(clean_name) {
        return resolved(handle);
    }
    // An empty name is a substring of everything.
    if !clean_name.is_empty() {
        let fuzzy = directory.iter().find(|(display_name, _)| {
            !display_name.is_empty()
                && (display_name.contains(clean_name) || clean_name.contains(display_name.as_str()))
        });
        if let Some((_, handle)) = fuzzy {
            return resolved(handle);
        }
    }

    ResolvedIdentity::unresolved(clean_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(entries: &[(&str, &str)]) -> MemberDirectory {
        entries
            .iter()
            .map(|(name, handle)| (name.to_string(), handle.to_string()))
            .collect()
    }

    #[test]
    fn numeric_suffix_is_stripped_before_exact_match() {
        let dir = directory(&[("张三", "h1")]);
        let identity = resolve_identity("张三1", &dir);
        assert_eq!(identity.canonical_name, "张三");
        assert_eq!(identity.handle.as_deref(), Some("h1"));
    }

    #[test]
    fn full_width_suffix_is_stripped_too() {
        let dir = directory(&[("张三", "h1"), ("张三丰", "h9")]);
        assert_eq!(clean_display_name("张三２"), "张三");
        let identity = resolve_identity("张三２", &dir);
        assert_eq!(identity.canonical_name, "张三");
        assert_eq!(identity.handle.as_deref(), Some("h1"));
    }

    #[test]
    fn raw_name_exact_match_wins_over_cleaned_name() {
        let dir = directory(&[("张三", "h1"), ("张三2", "h2")]);
        let identity = resolve_identity("张三2", &dir);
        assert_eq!(identity.canonical_name, "张三");
        assert_eq!(identity.handle.as_deref(), Some("h2"));
    }

    #[test]
    fn unknown_name_degrades_to_plain_text() {
        let dir = directory(&[("张三", "h1")]);
        let identity = resolve_identity("李四", &dir);
        assert_eq!(identity, ResolvedIdentity::unresolved("李四"));
    }

    #[test]
    fn containment_fallback_matches_either_direction() {
        let dir = directory(&[("王小明", "h2")]);
        assert_eq!(
            resolve_identity("小明", &dir).handle.as_deref(),
            Some("h2")
        );
        assert_eq!(
            resolve_identity("销售部王小明 3", &dir),
            ResolvedIdentity {
                canonical_name: "销售部王小明".into(),
                handle: Some("h2".into()),
            }
        );
    }

    #[test]
    fn digits_only_name_does_not_fuzzy_match_everyone() {
        let dir = directory(&[("张三", "h1")]);
        let identity = resolve_identity("007", &dir);
        assert_eq!(identity, ResolvedIdentity::unresolved(""));
    }

    #[test]
    fn suffix_whitespace_is_trimmed() {
        assert_eq!(clean_display_name(" 张三 12 "), "张三");
        assert_eq!(clean_display_name("Alice"), "Alice");
    }
}
