use link_vault::utils::normalize_url;
use proptest::prelude::*;

fn has_web_scheme(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

proptest! {
    #[test]
    fn normalized_urls_always_carry_a_web_scheme(input in ".*") {
        let normalized = normalize_url(&input);
        prop_assert!(has_web_scheme(&normalized));
    }

    #[test]
    fn inputs_with_a_scheme_are_untouched(
        scheme in "[hH][tT][tT][pP][sS]?://",
        rest in "[a-z0-9./?=&-]{0,40}",
    ) {
        let input = format!("{}{}", scheme, rest);
        prop_assert_eq!(normalize_url(&input), input);
    }

    #[test]
    fn inputs_without_a_scheme_get_https(input in "[a-z0-9][a-z0-9.-]{0,30}(/[a-z0-9]{0,10})?") {
        prop_assume!(!has_web_scheme(&input));
        prop_assert_eq!(normalize_url(&input), format!("https://{}", input));
    }

    #[test]
    fn normalizing_twice_changes_nothing(input in ".*") {
        let once = normalize_url(&input);
        prop_assert_eq!(normalize_url(&once), once.clone());
    }
}
