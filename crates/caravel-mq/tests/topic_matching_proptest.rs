//! Property tests for topic pattern matching.

use caravel_mq::TopicPattern;
use proptest::prelude::*;

proptest! {
    /// A prefix wildcard matches every extension of its prefix.
    #[test]
    fn wildcard_matches_all_extensions(
        prefix in "[a-z]{1,8}:",
        suffix in "[a-z0-9:]{1,12}",
    ) {
        let pattern = TopicPattern::parse(&format!("{prefix}*"));
        let topic = format!("{prefix}{suffix}");
        prop_assert!(pattern.matches(&topic));
    }

    /// The bare namespace (without its delimiter) never matches.
    #[test]
    fn wildcard_rejects_bare_namespace(prefix in "[a-z]{1,8}") {
        let pattern = TopicPattern::parse(&format!("{prefix}:*"));
        prop_assert!(!pattern.matches(&prefix));
    }

    /// A sibling namespace sharing a leading substring never matches.
    #[test]
    fn wildcard_rejects_sibling_namespace(
        prefix in "[a-z]{1,8}",
        extra in "[a-z]{1,4}",
        suffix in "[a-z0-9]{1,8}",
    ) {
        let pattern = TopicPattern::parse(&format!("{prefix}:*"));
        let topic = format!("{prefix}{extra}:{suffix}");
        prop_assert!(!pattern.matches(&topic));
    }

    /// Exact patterns match themselves and nothing else.
    #[test]
    fn exact_matches_only_itself(
        topic in "[a-z:]{1,16}",
        other in "[a-z:]{1,16}",
    ) {
        let pattern = TopicPattern::parse(&topic);
        prop_assert!(pattern.matches(&topic));
        if other != topic {
            prop_assert!(!pattern.matches(&other));
        }
    }
}
