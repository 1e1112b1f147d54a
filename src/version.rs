use crate::error::RegistrationError;
use crate::types::VersionUrl;
use std::cmp::Ordering;

/// The version both sides speak, and the peer's URL for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Negotiated {
    pub version: String,
    pub base_url: String,
}

/// Highest version present in both lists, matched by exact version string.
pub fn negotiate(
    local: &[VersionUrl],
    offered: &[VersionUrl],
) -> Result<Negotiated, RegistrationError> {
    offered
        .iter()
        .filter(|peer| local.iter().any(|ours| ours.version == peer.version))
        .max_by(|a, b| compare_versions(&a.version, &b.version))
        .map(|peer| Negotiated {
            version: peer.version.clone(),
            base_url: peer.base_url.trim_end_matches('/').to_string(),
        })
        .ok_or_else(|| RegistrationError::UnsupportedVersion {
            offered: offered.iter().map(|v| v.version.clone()).collect(),
        })
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let numeric = |v: &str| {
        v.split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
    };
    match (numeric(a), numeric(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(entries: &[(&str, &str)]) -> Vec<VersionUrl> {
        entries
            .iter()
            .map(|(version, base_url)| VersionUrl {
                version: version.to_string(),
                base_url: base_url.to_string(),
            })
            .collect()
    }

    #[test]
    fn picks_the_shared_version() {
        let local = urls(&[("2.0", "http://me/cp/2.0")]);
        let offered = urls(&[("1.0", "http://peer/fp/1.0"), ("2.0", "http://peer/fp/2.0")]);
        let negotiated = negotiate(&local, &offered).unwrap();
        assert_eq!(negotiated.version, "2.0");
        assert_eq!(negotiated.base_url, "http://peer/fp/2.0");
    }

    #[test]
    fn prefers_the_highest_overlap() {
        let local = urls(&[("2.0", "a"), ("2.10", "b"), ("2.9", "c")]);
        let offered = urls(&[("2.9", "x"), ("2.10", "y"), ("2.0", "z")]);
        assert_eq!(negotiate(&local, &offered).unwrap().base_url, "y");
    }

    #[test]
    fn disjoint_lists_are_unsupported() {
        let local = urls(&[("2.0", "http://me/cp/2.0")]);
        let offered = urls(&[("1.0", "http://peer/fp/1.0")]);
        match negotiate(&local, &offered) {
            Err(RegistrationError::UnsupportedVersion { offered }) => {
                assert_eq!(offered, vec!["1.0".to_string()])
            }
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
        assert!(negotiate(&local, &[]).is_err());
    }
}
