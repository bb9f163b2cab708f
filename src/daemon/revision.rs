//! Resolving the revision to sync
//!
//! With signature verification off this is simply the branch head. With it
//! on, commits since the sync tag are checked oldest first and resolution
//! stops just before the first commit without a valid signature.

use super::interfaces::Repo;
use crate::config::GitConfig;
use crate::Result;
use std::fmt;

/// GPG signature status as reported by `git log --format=%G?`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// G: good signature
    Good,
    /// U: good signature, unknown validity of the key
    GoodUnknownValidity,
    /// B: bad signature
    Bad,
    /// X: good signature that has expired
    Expired,
    /// Y: good signature made by an expired key
    ExpiredKey,
    /// R: good signature made by a revoked key
    RevokedKey,
    /// E: signature cannot be checked, e.g. missing key
    CannotCheck,
    /// N: no signature
    None,
}

impl SignatureStatus {
    /// Parse the single-letter code git prints
    pub fn from_code(code: &str) -> Self {
        match code {
            "G" => SignatureStatus::Good,
            "U" => SignatureStatus::GoodUnknownValidity,
            "B" => SignatureStatus::Bad,
            "X" => SignatureStatus::Expired,
            "Y" => SignatureStatus::ExpiredKey,
            "R" => SignatureStatus::RevokedKey,
            "E" => SignatureStatus::CannotCheck,
            _ => SignatureStatus::None,
        }
    }

    /// The single-letter code
    pub fn code(&self) -> &'static str {
        match self {
            SignatureStatus::Good => "G",
            SignatureStatus::GoodUnknownValidity => "U",
            SignatureStatus::Bad => "B",
            SignatureStatus::Expired => "X",
            SignatureStatus::ExpiredKey => "Y",
            SignatureStatus::RevokedKey => "R",
            SignatureStatus::CannotCheck => "E",
            SignatureStatus::None => "N",
        }
    }
}

impl fmt::Display for SignatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Signature on a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Signing key id; empty for unsigned commits
    pub key: String,
    pub status: SignatureStatus,
}

impl Signature {
    /// Whether the signature passes policy
    ///
    /// Only `G`: a good signature from a key of unknown validity (`U`) could
    /// come from any key in the keyring.
    pub fn is_valid(&self) -> bool {
        self.status == SignatureStatus::Good
    }
}

/// A commit on the watched branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub revision: String,
    pub signature: Signature,
}

/// The newest commit that failed signature policy
///
/// Reported for logging only; the last valid ancestor is still synced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCommit {
    pub revision: String,
    pub signature: Signature,
}

impl From<Commit> for InvalidCommit {
    fn from(commit: Commit) -> Self {
        Self {
            revision: commit.revision,
            signature: commit.signature,
        }
    }
}

/// Resolve the newest revision on the configured branch that passes policy
///
/// Returns the revision plus the first rejected commit, if any. Callers bound
/// this with a timeout; it has none of its own.
pub async fn latest_valid_revision(
    repo: &dyn Repo,
    git: &GitConfig,
) -> Result<(String, Option<InvalidCommit>)> {
    let head = repo.branch_head(&git.branch).await?;
    if !git.verify_signatures {
        return Ok((head, None));
    }

    // No tag yet: every commit up to head is checked
    let tag_revision = repo
        .verify_tag(&git.sync_tag)
        .await?
        .unwrap_or_default();
    let commits = repo
        .commits_between(&tag_revision, &head, &git.paths)
        .await?;

    Ok(first_invalid(commits, head, tag_revision))
}

/// Walk `commits` (newest first) from the oldest end and stop before the
/// first invalid one
fn first_invalid(
    mut commits: Vec<Commit>,
    head: String,
    tag_revision: String,
) -> (String, Option<InvalidCommit>) {
    let Some(i) = commits.iter().rposition(|c| !c.signature.is_valid()) else {
        return (head, None);
    };

    let revision = match commits.get(i + 1) {
        Some(parent) => parent.revision.clone(),
        None => tag_revision,
    };
    let invalid = commits.swap_remove(i);
    (revision, Some(invalid.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReconcilerError;
    use async_trait::async_trait;

    fn commit(revision: &str, status: SignatureStatus) -> Commit {
        Commit {
            revision: revision.to_string(),
            signature: Signature {
                key: format!("key-{}", revision),
                status,
            },
        }
    }

    #[derive(Default)]
    struct FakeRepo {
        head: String,
        tag: Option<String>,
        unsigned_tag: bool,
        commits: Vec<Commit>,
        from: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl Repo for FakeRepo {
        fn origin_url(&self) -> String {
            "file:///fake".to_string()
        }

        async fn refresh(&self) -> Result<()> {
            Ok(())
        }

        async fn branch_head(&self, _branch: &str) -> Result<String> {
            Ok(self.head.clone())
        }

        async fn verify_tag(&self, tag: &str) -> Result<Option<String>> {
            if self.unsigned_tag {
                return Err(ReconcilerError::Signature(format!("tag {} not signed", tag)));
            }
            Ok(self.tag.clone())
        }

        async fn commits_between(
            &self,
            from: &str,
            _to: &str,
            _paths: &[String],
        ) -> Result<Vec<Commit>> {
            *self.from.lock().unwrap() = Some(from.to_string());
            Ok(self.commits.clone())
        }
    }

    fn git(verify: bool) -> GitConfig {
        GitConfig::new("file:///fake").with_verify_signatures(verify)
    }

    #[tokio::test]
    async fn test_verification_disabled_returns_head() {
        let repo = FakeRepo {
            head: "c3".to_string(),
            tag: None,
            commits: vec![commit("c3", SignatureStatus::None)],
            ..Default::default()
        };

        let (rev, invalid) = latest_valid_revision(&repo, &git(false)).await.unwrap();
        assert_eq!(rev, "c3");
        assert!(invalid.is_none());
    }

    #[tokio::test]
    async fn test_all_valid_returns_head() {
        let repo = FakeRepo {
            head: "c3".to_string(),
            tag: Some("c0".to_string()),
            commits: vec![
                commit("c3", SignatureStatus::Good),
                commit("c2", SignatureStatus::Good),
                commit("c1", SignatureStatus::Good),
            ],
            ..Default::default()
        };

        let (rev, invalid) = latest_valid_revision(&repo, &git(true)).await.unwrap();
        assert_eq!(rev, "c3");
        assert!(invalid.is_none());
    }

    #[tokio::test]
    async fn test_invalid_newest_returns_parent() {
        let repo = FakeRepo {
            head: "c3".to_string(),
            tag: Some("c0".to_string()),
            commits: vec![
                commit("c3", SignatureStatus::Bad),
                commit("c2", SignatureStatus::Good),
                commit("c1", SignatureStatus::Good),
            ],
            ..Default::default()
        };

        let (rev, invalid) = latest_valid_revision(&repo, &git(true)).await.unwrap();
        assert_eq!(rev, "c2");
        let invalid = invalid.unwrap();
        assert_eq!(invalid.revision, "c3");
        assert_eq!(invalid.signature.key, "key-c3");
    }

    #[tokio::test]
    async fn test_stops_at_oldest_invalid() {
        let repo = FakeRepo {
            head: "c3".to_string(),
            tag: Some("c0".to_string()),
            commits: vec![
                commit("c3", SignatureStatus::Good),
                commit("c2", SignatureStatus::None),
                commit("c1", SignatureStatus::Good),
            ],
            ..Default::default()
        };

        let (rev, invalid) = latest_valid_revision(&repo, &git(true)).await.unwrap();
        assert_eq!(rev, "c1");
        assert_eq!(invalid.unwrap().revision, "c2");
    }

    #[tokio::test]
    async fn test_invalid_oldest_falls_back_to_tag() {
        let repo = FakeRepo {
            head: "c2".to_string(),
            tag: Some("c0".to_string()),
            commits: vec![
                commit("c2", SignatureStatus::Good),
                commit("c1", SignatureStatus::RevokedKey),
            ],
            ..Default::default()
        };

        let (rev, invalid) = latest_valid_revision(&repo, &git(true)).await.unwrap();
        assert_eq!(rev, "c0");
        assert_eq!(invalid.unwrap().revision, "c1");
    }

    #[tokio::test]
    async fn test_unverified_tag_is_an_error() {
        let repo = FakeRepo {
            head: "c1".to_string(),
            tag: Some("c0".to_string()),
            unsigned_tag: true,
            ..Default::default()
        };

        let result = latest_valid_revision(&repo, &git(true)).await;
        assert!(matches!(result, Err(ReconcilerError::Signature(_))));
    }

    #[tokio::test]
    async fn test_missing_tag_checks_all_commits() {
        let repo = FakeRepo {
            head: "c2".to_string(),
            tag: None,
            commits: vec![
                commit("c2", SignatureStatus::Good),
                commit("c1", SignatureStatus::Good),
            ],
            ..Default::default()
        };

        let (rev, invalid) = latest_valid_revision(&repo, &git(true)).await.unwrap();
        assert_eq!(rev, "c2");
        assert!(invalid.is_none());
        assert_eq!(repo.from.lock().unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_missing_tag_and_invalid_oldest_resolves_nothing() {
        let repo = FakeRepo {
            head: "c2".to_string(),
            tag: None,
            commits: vec![
                commit("c2", SignatureStatus::Good),
                commit("c1", SignatureStatus::None),
            ],
            ..Default::default()
        };

        let (rev, invalid) = latest_valid_revision(&repo, &git(true)).await.unwrap();
        assert_eq!(rev, "");
        assert_eq!(invalid.unwrap().revision, "c1");
    }

    #[test]
    fn test_only_good_signatures_are_valid() {
        let valid: Vec<_> = ["G", "U", "B", "X", "Y", "R", "E", "N"]
            .into_iter()
            .filter(|code| {
                Signature {
                    key: "K".to_string(),
                    status: SignatureStatus::from_code(code),
                }
                .is_valid()
            })
            .collect();
        assert_eq!(valid, vec!["G"]);
    }

    #[test]
    fn test_signature_codes() {
        for code in ["G", "U", "B", "X", "Y", "R", "E", "N"] {
            assert_eq!(SignatureStatus::from_code(code).code(), code);
        }
        assert_eq!(SignatureStatus::from_code("?"), SignatureStatus::None);
    }
}
