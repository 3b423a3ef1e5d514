//! Filter construction from persisted request fields.
//!
//! Request rows arrive as raw strings so a row written by an older or
//! foreign driver never fails the run: unknown values fall back to the
//! documented defaults, with a warning surfaced to the execution log.

use crate::model::TestPlatform;

/// What the host runner is asked to select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    /// Exact full-name match (class or method), unconstrained when empty.
    pub name: Option<String>,
    /// Category-set match, unconstrained when empty.
    pub categories: Vec<String>,
    /// The single execution context for this invocation (never `both`).
    pub platform: TestPlatform,
}

impl RunFilter {
    pub fn unconstrained(platform: TestPlatform) -> Self {
        Self {
            name: None,
            categories: Vec::new(),
            platform,
        }
    }
}

/// Parse a stored platform string; unknown values fall back to `editor`.
/// Returns the platform and the warning to log, if any.
pub fn parse_platform(raw: &str) -> (TestPlatform, Option<String>) {
    match TestPlatform::parse(raw) {
        Some(p) => (p, None),
        None => (
            TestPlatform::Editor,
            Some(format!(
                "unknown test platform '{}'; falling back to editor",
                raw
            )),
        ),
    }
}

/// Build the filter for one execution context.
///
/// Precedence: `all` clears every constraint; `class`/`method` match the
/// filter string exactly; `category` splits a comma-separated set; anything
/// else degrades to `all` with a warning.
pub fn build_filter(
    request_type: &str,
    test_filter: Option<&str>,
    platform: TestPlatform,
) -> (RunFilter, Option<String>) {
    let filter_text = test_filter.map(str::trim).filter(|s| !s.is_empty());

    match request_type {
        "all" => (RunFilter::unconstrained(platform), None),
        "class" | "method" => match filter_text {
            Some(name) => (
                RunFilter {
                    name: Some(name.to_string()),
                    categories: Vec::new(),
                    platform,
                },
                None,
            ),
            None => (
                RunFilter::unconstrained(platform),
                Some(format!(
                    "{} request without a test filter; running everything",
                    request_type
                )),
            ),
        },
        "category" => match filter_text {
            Some(categories) => (
                RunFilter {
                    name: None,
                    categories: categories
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect(),
                    platform,
                },
                None,
            ),
            None => (
                RunFilter::unconstrained(platform),
                Some("category request without categories; running everything".to_string()),
            ),
        },
        other => (
            RunFilter::unconstrained(platform),
            Some(format!(
                "unknown request type '{}'; running everything",
                other
            )),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_clears_constraints() {
        let (f, warning) = build_filter("all", Some("ignored"), TestPlatform::Editor);
        assert_eq!(f, RunFilter::unconstrained(TestPlatform::Editor));
        assert!(warning.is_none());
    }

    #[test]
    fn test_class_and_method_match_exactly() {
        for ty in ["class", "method"] {
            let (f, warning) = build_filter(ty, Some("Game.FooTests"), TestPlatform::Runtime);
            assert_eq!(f.name.as_deref(), Some("Game.FooTests"));
            assert!(f.categories.is_empty());
            assert!(warning.is_none());
        }
    }

    #[test]
    fn test_category_splits_set() {
        let (f, warning) = build_filter("category", Some("Smoke, Integration"), TestPlatform::Editor);
        assert_eq!(f.categories, vec!["Smoke", "Integration"]);
        assert!(f.name.is_none());
        assert!(warning.is_none());
    }

    #[test]
    fn test_unknown_type_degrades_to_all_with_warning() {
        let (f, warning) = build_filter("fuzz", Some("x"), TestPlatform::Editor);
        assert_eq!(f, RunFilter::unconstrained(TestPlatform::Editor));
        assert!(warning.unwrap().contains("unknown request type"));
    }

    #[test]
    fn test_missing_filter_degrades_with_warning() {
        let (f, warning) = build_filter("class", None, TestPlatform::Editor);
        assert!(f.name.is_none());
        assert!(warning.is_some());

        let (f, warning) = build_filter("method", Some("   "), TestPlatform::Editor);
        assert!(f.name.is_none());
        assert!(warning.is_some());
    }

    #[test]
    fn test_unknown_platform_falls_back_to_editor() {
        let (p, warning) = parse_platform("console");
        assert_eq!(p, TestPlatform::Editor);
        assert!(warning.is_some());

        let (p, warning) = parse_platform("runtime");
        assert_eq!(p, TestPlatform::Runtime);
        assert!(warning.is_none());
    }
}
