//! Policy selection by tags and environment.

use crate::model::Policy;

/// Variables probed, in order, by [`detect_environment`].
pub const ENVIRONMENT_VARIABLES: &[&str] = &[
    "ENV",
    "ENVIRONMENT",
    "NODE_ENV",
    "RAILS_ENV",
    "RACK_ENV",
    "DJANGO_ENV",
    "DJANGO_SETTINGS_MODULE",
    "FLASK_ENV",
    "APP_ENV",
    "SYMFONY_ENV",
    "SPRING_PROFILES_ACTIVE",
    "ASPNETCORE_ENVIRONMENT",
    "GO_ENV",
    "GIN_MODE",
    "MIX_ENV",
    "REACT_APP_ENV",
    "VUE_APP_ENV",
    "NG_ENV",
    "RUST_ENV",
    "PLACK_ENV",
    "KOTLIN_ENV",
];

/// Parameters for [`select`]. Empty fields are no-ops.
#[derive(Debug, Clone, Default)]
pub struct PolicyFilter {
    pub tags_any: String,
    pub tags_all: String,
    pub environment: String,
}

impl PolicyFilter {
    /// Apply `any_of`, `all_of` and `by_environment` in that order.
    pub fn apply(&self, policies: Vec<Policy>) -> Vec<Policy> {
        let policies = any_of(policies, &self.tags_any);
        let policies = all_of(policies, &self.tags_all);
        by_environment(policies, &self.environment)
    }
}

/// Split a comma-separated tag query, dropping empty entries.
pub fn parse_tags(query: &str) -> Vec<String> {
    query
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Keep policies carrying at least one of the queried tags.
pub fn any_of(policies: Vec<Policy>, query: &str) -> Vec<Policy> {
    let tags = parse_tags(query);
    if tags.is_empty() {
        return policies;
    }
    policies
        .into_iter()
        .filter(|p| tags.iter().any(|t| has_tag(p, t)))
        .collect()
}

/// Keep policies carrying every queried tag.
pub fn all_of(policies: Vec<Policy>, query: &str) -> Vec<Policy> {
    let tags = parse_tags(query);
    if tags.is_empty() {
        return policies;
    }
    policies
        .into_iter()
        .filter(|p| tags.iter().all(|t| has_tag(p, t)))
        .collect()
}

/// Keep policies with an enforcement record for `environment` or `all`.
pub fn by_environment(policies: Vec<Policy>, environment: &str) -> Vec<Policy> {
    let environment = environment.trim();
    if environment.is_empty() {
        return policies;
    }
    policies
        .into_iter()
        .filter(|p| {
            p.enforcement.iter().any(|e| {
                e.environment.eq_ignore_ascii_case("all")
                    || e.environment.eq_ignore_ascii_case(environment)
            })
        })
        .collect()
}

fn has_tag(policy: &Policy, tag: &str) -> bool {
    policy.metadata.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
}

/// First non-empty value among [`ENVIRONMENT_VARIABLES`].
pub fn detect_environment() -> Option<String> {
    detect_environment_with(|name| std::env::var(name).ok())
}

pub fn detect_environment_with<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    ENVIRONMENT_VARIABLES
        .iter()
        .filter_map(|name| lookup(name))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Enforcement;

    fn policy(id: &str, tags: &[&str], envs: &[&str]) -> Policy {
        let mut p = Policy {
            id: id.to_string(),
            ..Default::default()
        };
        p.metadata.tags = tags.iter().map(|t| t.to_string()).collect();
        p.enforcement = envs
            .iter()
            .map(|e| Enforcement {
                environment: e.to_string(),
                ..Default::default()
            })
            .collect();
        p
    }

    fn ids(policies: &[Policy]) -> Vec<&str> {
        policies.iter().map(|p| p.id.as_str()).collect()
    }

    fn fixture() -> Vec<Policy> {
        vec![
            policy("a", &["security", "a"], &["prod"]),
            policy("b", &["Security", "aws", "b"], &["all"]),
            policy("c", &["style", "c"], &["dev"]),
        ]
    }

    #[test]
    fn empty_queries_are_noops() {
        let filter = PolicyFilter::default();
        assert_eq!(ids(&filter.apply(fixture())), vec!["a", "b", "c"]);
    }

    #[test]
    fn any_of_is_case_insensitive() {
        let out = any_of(fixture(), "SECURITY, style");
        assert_eq!(ids(&out), vec!["a", "b", "c"]);
        let out = any_of(fixture(), "aws");
        assert_eq!(ids(&out), vec!["b"]);
    }

    #[test]
    fn all_of_requires_every_tag() {
        let out = all_of(fixture(), "security,aws");
        assert_eq!(ids(&out), vec!["b"]);
    }

    #[test]
    fn environment_keeps_all_wildcard() {
        let out = by_environment(fixture(), "prod");
        assert_eq!(ids(&out), vec!["a", "b"]);
    }

    #[test]
    fn composed_in_order() {
        let filter = PolicyFilter {
            tags_any: "security".into(),
            tags_all: String::new(),
            environment: "dev".into(),
        };
        assert_eq!(ids(&filter.apply(fixture())), vec!["b"]);
    }

    #[test]
    fn self_tag_selects_single_policy() {
        assert_eq!(ids(&any_of(fixture(), "c")), vec!["c"]);
    }

    #[test]
    fn detects_first_non_empty_variable() {
        let env = |name: &str| match name {
            "ENV" => Some("  ".to_string()),
            "NODE_ENV" => Some("staging".to_string()),
            "APP_ENV" => Some("prod".to_string()),
            _ => None,
        };
        assert_eq!(detect_environment_with(env), Some("staging".to_string()));
        assert_eq!(detect_environment_with(|_| None), None);
    }
}
