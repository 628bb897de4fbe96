//! Key-split grouping and share recombination
//!
//! Key access objects sharing a `splitId` form one split group with a single
//! recombination mode. `all-of` groups XOR every member share back into the
//! data key; `any-of` groups are satisfied by the first authorized share.
//! Recombination only ever uses the shares of exactly one group, and partial
//! key material is never released.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::KasError;
use crate::protocol::KeyAccessObject;

/// How the shares of a split group recombine
///
/// A closed set: adding a mode forces every match site to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SplitMode {
    /// One share is the whole key
    #[default]
    Single,
    /// Every member share is required; combination is XOR
    AllOf,
    /// Any one authorized member share is the whole key
    AnyOf,
}

impl std::fmt::Display for SplitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SplitMode::Single => "single",
            SplitMode::AllOf => "all-of",
            SplitMode::AnyOf => "any-of",
        };
        f.write_str(s)
    }
}

/// A set of KAOs that recombine into one data key
#[derive(Debug)]
pub struct SplitGroup<'a> {
    /// None for standalone objects
    pub split_id: Option<String>,
    pub mode: SplitMode,
    pub members: Vec<&'a KeyAccessObject>,
}

/// Group the KAOs of one entry by split id, preserving first-appearance order
///
/// Objects without a `splitId` each form their own `Single` group. Members of
/// one group must agree on the mode; a conflict rejects the entry as
/// malformed before any cryptographic work.
pub fn group_by_split(kaos: &[KeyAccessObject]) -> Result<Vec<SplitGroup<'_>>, KasError> {
    let mut groups: Vec<SplitGroup<'_>> = Vec::new();

    for kao in kaos {
        match &kao.split_id {
            None => groups.push(SplitGroup {
                split_id: None,
                mode: SplitMode::Single,
                members: vec![kao],
            }),
            Some(split_id) => {
                let mode = kao.mode.unwrap_or(SplitMode::AllOf);
                if let Some(group) = groups
                    .iter_mut()
                    .find(|g| g.split_id.as_deref() == Some(split_id))
                {
                    if kao.mode.is_some_and(|m| m != group.mode) {
                        return Err(KasError::Validation(format!(
                            "split group '{split_id}' mixes modes {} and {}",
                            group.mode, mode
                        )));
                    }
                    group.members.push(kao);
                } else {
                    if mode == SplitMode::Single {
                        return Err(KasError::Validation(format!(
                            "split group '{split_id}' declares mode 'single'"
                        )));
                    }
                    groups.push(SplitGroup {
                        split_id: Some(split_id.clone()),
                        mode,
                        members: vec![kao],
                    });
                }
            }
        }
    }

    Ok(groups)
}

/// Recombine `all-of` shares into the data key by XOR
///
/// All shares must have equal length; the combination is reversible, so
/// splitting and combining round-trips bit for bit.
pub fn combine_shares(shares: &[Vec<u8>]) -> Result<Vec<u8>, KasError> {
    let Some(first) = shares.first() else {
        return Err(KasError::KeyManagement(
            "cannot combine an empty share set".to_string(),
        ));
    };

    let mut combined = first.clone();
    for share in &shares[1..] {
        if share.len() != combined.len() {
            return Err(KasError::KeyManagement(format!(
                "share length mismatch: {} vs {}",
                share.len(),
                combined.len()
            )));
        }
        for (acc, byte) in combined.iter_mut().zip(share.iter()) {
            *acc ^= byte;
        }
    }
    Ok(combined)
}

/// Split a key into `n` XOR shares (producer side, used by tests)
///
/// The first `n - 1` shares are random; the last is the XOR of the key with
/// all of them, so combining all `n` reproduces the key.
pub fn split_key(key: &[u8], n: usize) -> Vec<Vec<u8>> {
    assert!(n >= 1, "split requires at least one share");

    let mut shares: Vec<Vec<u8>> = Vec::with_capacity(n);
    let mut residual = key.to_vec();
    for _ in 0..n - 1 {
        let mut share = vec![0u8; key.len()];
        OsRng.fill_bytes(&mut share);
        for (acc, byte) in residual.iter_mut().zip(share.iter()) {
            *acc ^= byte;
        }
        shares.push(share);
    }
    shares.push(residual);
    shares
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PolicyBinding;

    fn kao(id: &str, split_id: Option<&str>, mode: Option<SplitMode>) -> KeyAccessObject {
        KeyAccessObject {
            id: id.to_string(),
            wrapped_key_share: "AAAA".to_string(),
            kas_identifier: "kas-local".to_string(),
            policy_binding: PolicyBinding::new("unused"),
            split_id: split_id.map(String::from),
            mode,
            encrypted_metadata: None,
            kid: None,
        }
    }

    #[test]
    fn test_standalone_kaos_form_single_groups() {
        let kaos = vec![kao("a", None, None), kao("b", None, None)];
        let groups = group_by_split(&kaos).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.mode == SplitMode::Single));
    }

    #[test]
    fn test_grouping_preserves_order_and_membership() {
        let kaos = vec![
            kao("a", Some("s1"), Some(SplitMode::AllOf)),
            kao("b", None, None),
            kao("c", Some("s1"), None),
            kao("d", Some("s2"), Some(SplitMode::AnyOf)),
        ];
        let groups = group_by_split(&kaos).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].split_id.as_deref(), Some("s1"));
        assert_eq!(groups[0].members.len(), 2);
        assert_eq!(groups[0].mode, SplitMode::AllOf);
        assert_eq!(groups[1].split_id, None);
        assert_eq!(groups[2].mode, SplitMode::AnyOf);
    }

    #[test]
    fn test_mode_conflict_is_rejected() {
        let kaos = vec![
            kao("a", Some("s1"), Some(SplitMode::AllOf)),
            kao("b", Some("s1"), Some(SplitMode::AnyOf)),
        ];
        let err = group_by_split(&kaos).unwrap_err();
        assert!(matches!(err, KasError::Validation(_)));
    }

    #[test]
    fn test_split_combine_roundtrip() {
        let key = b"the-original-data-encryption-key";
        for n in 1..=4 {
            let shares = split_key(key, n);
            assert_eq!(shares.len(), n);
            let combined = combine_shares(&shares).unwrap();
            assert_eq!(combined, key.to_vec());
        }
    }

    #[test]
    fn test_missing_share_does_not_reconstruct() {
        let key = b"the-original-data-encryption-key";
        let shares = split_key(key, 3);
        let partial = combine_shares(&shares[..2]).unwrap();
        assert_ne!(partial, key.to_vec());
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let shares = vec![vec![0u8; 32], vec![0u8; 16]];
        assert!(combine_shares(&shares).is_err());
    }

    #[test]
    fn test_empty_share_set_is_rejected() {
        assert!(combine_shares(&[]).is_err());
    }
}
