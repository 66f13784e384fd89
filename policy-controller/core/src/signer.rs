use crate::config::{SignerPolicy, SignerRule, SubjectPattern};
use crate::pattern::{match_pattern, match_pattern_array};
use serde::Serialize;

/// A cryptographically verified signer identity.
///
/// Only ever constructed by a successful verification; never built from
/// untrusted input.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Signer {
    pub email: String,
    pub common_name: String,
    pub fingerprint: String,
}

impl Signer {
    pub fn name(&self) -> &str {
        if !self.email.is_empty() {
            &self.email
        } else {
            &self.common_name
        }
    }

    /// Fingerprint-qualified display form used in deny messages.
    pub fn name_with_fingerprint(&self) -> String {
        if self.fingerprint.is_empty() {
            self.name().to_string()
        } else {
            format!("{} (fingerprint: {})", self.name(), self.fingerprint)
        }
    }
}

/// Finds the first signer rule authorizing `signer` in `namespace`.
///
/// A rule applies within its declared namespaces, or everywhere when
/// unscoped. Cluster-scoped requests (empty namespace) only match unscoped
/// rules. Every populated dimension of a rule (subjects, key paths) must be
/// satisfied; a rule with neither fails closed.
pub fn match_signer<'p>(
    policy: &'p SignerPolicy,
    namespace: &str,
    signer: &Signer,
    verified_key_paths: &[String],
) -> Option<&'p SignerRule> {
    policy
        .signers
        .iter()
        .find(|rule| rule_applies(rule, namespace) && rule_satisfied(rule, signer, verified_key_paths))
}

fn rule_applies(rule: &SignerRule, namespace: &str) -> bool {
    if rule.namespaces.is_empty() {
        return true;
    }
    !namespace.is_empty() && rule.namespaces.iter().any(|p| match_pattern(p, namespace))
}

fn rule_satisfied(rule: &SignerRule, signer: &Signer, verified_key_paths: &[String]) -> bool {
    if rule.subjects.is_empty() && rule.key_paths.is_empty() {
        return false;
    }
    let subjects_ok = rule.subjects.is_empty()
        || rule.subjects.iter().any(|s| subject_matches(s, signer));
    let keys_ok = rule.key_paths.is_empty()
        || rule
            .key_paths
            .iter()
            .any(|p| match_pattern_array(p, verified_key_paths));
    subjects_ok && keys_ok
}

fn subject_matches(subject: &SubjectPattern, signer: &Signer) -> bool {
    if subject.email.is_none() && subject.common_name.is_none() && subject.fingerprint.is_none() {
        return false;
    }
    let field_ok = |pattern: &Option<String>, value: &str| match pattern {
        Some(p) => match_pattern(p, value),
        None => true,
    };
    field_ok(&subject.email, &signer.email)
        && field_ok(&subject.common_name, &signer.common_name)
        && field_ok(&subject.fingerprint, &signer.fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Signer {
        Signer {
            email: "release@example.com".to_string(),
            common_name: "Release Bot".to_string(),
            fingerprint: "0D3B2FA7".to_string(),
        }
    }

    fn policy(rules: Vec<SignerRule>) -> SignerPolicy {
        SignerPolicy {
            name: "default".to_string(),
            signers: rules,
            break_glass: vec![],
        }
    }

    #[test]
    fn namespaced_rule_matches_only_its_namespaces() {
        let rules = vec![SignerRule {
            name: "prod-signers".to_string(),
            namespaces: vec!["prod-*".to_string()],
            subjects: vec![SubjectPattern {
                email: Some("release@example.com".to_string()),
                ..Default::default()
            }],
            key_paths: vec![],
        }];
        let policy = policy(rules);
        assert!(match_signer(&policy, "prod-a", &signer(), &[]).is_some());
        assert!(match_signer(&policy, "dev", &signer(), &[]).is_none());
        // Cluster-scoped requests only match unscoped rules.
        assert!(match_signer(&policy, "", &signer(), &[]).is_none());
    }

    #[test]
    fn unscoped_rule_is_global() {
        let policy = policy(vec![SignerRule {
            name: "anyone-with-this-fingerprint".to_string(),
            namespaces: vec![],
            subjects: vec![SubjectPattern {
                fingerprint: Some("0D3B*".to_string()),
                ..Default::default()
            }],
            key_paths: vec![],
        }]);
        assert!(match_signer(&policy, "", &signer(), &[]).is_some());
        assert!(match_signer(&policy, "dev", &signer(), &[]).is_some());
    }

    #[test]
    fn key_path_rule() {
        let policy = policy(vec![SignerRule {
            name: "by-key".to_string(),
            namespaces: vec![],
            subjects: vec![],
            key_paths: vec!["/keys/prod/*".to_string()],
        }]);
        let verified = vec!["/keys/prod/ring.gpg".to_string()];
        assert!(match_signer(&policy, "prod-a", &signer(), &verified).is_some());
        assert!(match_signer(&policy, "prod-a", &signer(), &[]).is_none());
    }

    #[test]
    fn empty_rule_fails_closed() {
        let policy = policy(vec![SignerRule::default()]);
        assert!(match_signer(&policy, "prod-a", &signer(), &[]).is_none());
    }

    #[test]
    fn first_matching_rule_wins() {
        let mk = |name: &str| SignerRule {
            name: name.to_string(),
            namespaces: vec![],
            subjects: vec![SubjectPattern {
                email: Some("*@example.com".to_string()),
                ..Default::default()
            }],
            key_paths: vec![],
        };
        let policy = policy(vec![mk("first"), mk("second")]);
        let matched = match_signer(&policy, "ns", &signer(), &[]).unwrap();
        assert_eq!(matched.name, "first");
    }

    #[test]
    fn name_with_fingerprint() {
        assert_eq!(
            signer().name_with_fingerprint(),
            "release@example.com (fingerprint: 0D3B2FA7)"
        );
        let anonymous = Signer {
            common_name: "CI".to_string(),
            ..Default::default()
        };
        assert_eq!(anonymous.name_with_fingerprint(), "CI");
    }
}
