//! Local mirror of the configuration repository
//!
//! The mirror is a bare clone kept current by fetching from `origin`. Every
//! successful fetch sends a refreshed notification; notifications coalesce,
//! so a slow consumer only ever sees one pending.
//!
//! Reads and writes go through git2 on the blocking pool. Signature checks
//! and signed tags shell out to the `git` CLI, which knows how to call gpg.
//!
//! With a signing key the sync tag is a signed annotated tag and is checked
//! with `git verify-tag`. Without one the tag is unsigned, so only the
//! signature of the commit it points at is checked.

use crate::config::GitConfig;
use crate::daemon::{Commit, Repo, Signature, SignatureStatus};
use crate::sync::SyncTagStore;
use crate::{ReconcilerError, Result};
use async_trait::async_trait;
use git2::{AutotagOption, Cred, FetchOptions, PushOptions, RemoteCallbacks, Repository};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Refspecs fetched on every refresh; tags are forced so a moved sync tag is seen
const FETCH_REFSPECS: [&str; 2] = [
    "+refs/heads/*:refs/remotes/origin/*",
    "+refs/tags/*:refs/tags/*",
];

/// Field separator in `git log` output
const LOG_SEPARATOR: char = '|';

/// Git credentials configuration
#[derive(Debug, Clone, Default)]
pub struct GitCredentials {
    /// Token for HTTPS authentication
    pub token: Option<String>,

    /// Username paired with the token
    pub username: Option<String>,
}

impl GitCredentials {
    /// Read a token from `RECONCILER_GIT_TOKEN`, then `GITHUB_TOKEN`
    ///
    /// Without a token, SSH URLs authenticate through the agent.
    pub fn from_env() -> Self {
        let token = std::env::var("RECONCILER_GIT_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty());

        if token.is_some() {
            tracing::debug!("Using git token from environment");
        }

        Self {
            token,
            username: Some("git".to_string()),
        }
    }

    /// Create callback for git2 authentication
    fn create_callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();

        let token = self.token.clone();
        let username = self.username.clone();

        callbacks.credentials(move |url, username_from_url, _allowed_types| {
            tracing::debug!(url = url, "Git credentials callback invoked");

            if let Some(ref token) = token {
                let user = username.as_deref().or(username_from_url).unwrap_or("git");
                return Cred::userpass_plaintext(user, token);
            }

            if let Some(username) = username_from_url {
                return Cred::ssh_key_from_agent(username);
            }

            Cred::default()
        });

        callbacks
    }
}

struct Inner {
    url: String,
    path: PathBuf,
    user_name: String,
    user_email: String,
    signing_key: Option<String>,
    credentials: GitCredentials,

    /// Serialises fetches from the refresh loop and from the event loop
    fetch_lock: Mutex<()>,
    notify: mpsc::Sender<()>,
}

impl Inner {
    fn open(&self) -> Result<Repository> {
        Repository::open_bare(&self.path).map_err(|e| {
            ReconcilerError::Git(format!(
                "Mirror not available at {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn fetch_options(&self) -> FetchOptions<'_> {
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(self.credentials.create_callbacks());
        fetch_options.download_tags(AutotagOption::All);
        fetch_options
    }

    /// Clone if the mirror does not exist yet, otherwise fetch
    fn clone_or_fetch(&self) -> Result<()> {
        if Repository::open_bare(&self.path).is_err() {
            tracing::info!(url = %self.url, path = %self.path.display(), "Cloning mirror");

            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut builder = git2::build::RepoBuilder::new();
            builder.bare(true);
            builder.fetch_options(self.fetch_options());
            builder.clone(&self.url, &self.path)?;
        }

        let repo = self.open()?;
        let mut remote = repo.find_remote("origin")?;
        let mut fetch_options = self.fetch_options();
        remote.fetch(&FETCH_REFSPECS, Some(&mut fetch_options), None)?;
        Ok(())
    }

    fn branch_head(&self, branch: &str) -> Result<String> {
        let repo = self.open()?;

        let candidates = [
            format!("refs/remotes/origin/{}", branch),
            format!("refs/heads/{}", branch),
        ];
        for name in &candidates {
            if let Ok(reference) = repo.find_reference(name) {
                return Ok(reference.peel_to_commit()?.id().to_string());
            }
        }

        Err(ReconcilerError::Git(format!(
            "Branch {} not found in mirror of {}",
            branch, self.url
        )))
    }

    fn tag_revision(&self, tag: &str) -> Result<Option<String>> {
        let repo = self.open()?;
        let result = match repo.find_reference(&format!("refs/tags/{}", tag)) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        };
        result
    }

    /// Point `tag` at `revision` with an unsigned annotated tag
    fn write_tag(&self, tag: &str, revision: &str) -> Result<()> {
        let repo = self.open()?;
        let target = repo.revparse_single(revision)?;
        let tagger = git2::Signature::now(&self.user_name, &self.user_email)?;
        repo.tag(tag, &target, &tagger, &tag_message(revision), true)?;
        Ok(())
    }

    fn push_tag(&self, tag: &str) -> Result<()> {
        let repo = self.open()?;
        let mut callbacks = self.credentials.create_callbacks();
        callbacks.push_update_reference(|refname, status| match status {
            Some(msg) => Err(git2::Error::from_str(&format!(
                "Push of {} rejected: {}",
                refname, msg
            ))),
            None => Ok(()),
        });
        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(callbacks);

        let refspec = format!("+refs/tags/{}:refs/tags/{}", tag, tag);
        let mut remote = repo.find_remote("origin")?;
        remote.push(&[refspec.as_str()], Some(&mut push_options))?;
        Ok(())
    }
}

fn tag_message(revision: &str) -> String {
    format!("Sync pointer\n\nRevision: {}\n", revision)
}

/// git2-backed mirror of the configuration repository
#[derive(Clone)]
pub struct GitMirror {
    inner: Arc<Inner>,
}

impl GitMirror {
    /// Create a mirror and the receiver for its refreshed notifications
    ///
    /// Nothing touches the network until the first refresh.
    pub fn new(git: &GitConfig, credentials: GitCredentials) -> (Self, mpsc::Receiver<()>) {
        let (notify, refreshed) = mpsc::channel(1);
        let mirror = Self {
            inner: Arc::new(Inner {
                url: git.url.clone(),
                path: git.path.clone(),
                user_name: git.user_name.clone(),
                user_email: git.user_email.clone(),
                signing_key: git.signing_key.clone(),
                credentials,
                fetch_lock: Mutex::new(()),
                notify,
            }),
        };
        (mirror, refreshed)
    }

    /// Local path of the mirror
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Refresh every `interval` until the task is aborted
    ///
    /// The first refresh happens immediately and clones the mirror if needed.
    pub fn spawn_refresh_loop(&self, interval: Duration) -> JoinHandle<()> {
        let mirror = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let start = Instant::now();
                match mirror.refresh().await {
                    Ok(()) => tracing::debug!(
                        url = %mirror.inner.url,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Mirror fetched"
                    ),
                    Err(e) => tracing::error!(url = %mirror.inner.url, error = %e, "Mirror refresh failed"),
                }
            }
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }

    /// Run `git` against the mirror and return stdout
    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&self.inner.path)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReconcilerError::Git(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Point `tag` at `revision` with a tag signed by `key`
    async fn write_signed_tag(&self, key: &str, tag: &str, revision: &str) -> Result<()> {
        let user_name = format!("user.name={}", self.inner.user_name);
        let user_email = format!("user.email={}", self.inner.user_email);
        let message = tag_message(revision);
        self.git(&[
            "-c",
            user_name.as_str(),
            "-c",
            user_email.as_str(),
            "tag",
            "-a",
            "-s",
            "--local-user",
            key,
            "-f",
            "-m",
            message.as_str(),
            tag,
            revision,
        ])
        .await?;
        Ok(())
    }

    /// Check the signature of the commit `revision`
    async fn verify_commit(&self, revision: &str) -> Result<()> {
        let output = self
            .git(&["log", "-1", "--pretty=format:%GK|%G?|%H", revision])
            .await?;
        let commit = parse_log(&output)?
            .into_iter()
            .next()
            .ok_or_else(|| ReconcilerError::Git(format!("Commit {} not found", revision)))?;

        if !commit.signature.is_valid() {
            return Err(ReconcilerError::Signature(format!(
                "Commit {} has signature status {}",
                commit.revision, commit.signature.status
            )));
        }
        Ok(())
    }
}

/// Parse `git log --pretty=format:%GK|%G?|%H` output
fn parse_log(output: &str) -> Result<Vec<Commit>> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.splitn(3, LOG_SEPARATOR);
            match (fields.next(), fields.next(), fields.next()) {
                (Some(key), Some(status), Some(revision)) => Ok(Commit {
                    revision: revision.trim().to_string(),
                    signature: Signature {
                        key: key.to_string(),
                        status: SignatureStatus::from_code(status),
                    },
                }),
                _ => Err(ReconcilerError::Git(format!(
                    "Unexpected git log line: {}",
                    line
                ))),
            }
        })
        .collect()
}

#[async_trait]
impl Repo for GitMirror {
    fn origin_url(&self) -> String {
        self.inner.url.clone()
    }

    async fn refresh(&self) -> Result<()> {
        let _guard = self.inner.fetch_lock.lock().await;
        self.blocking(|inner| inner.clone_or_fetch()).await?;

        // A notification already pending covers this fetch too
        let _ = self.inner.notify.try_send(());
        Ok(())
    }

    async fn branch_head(&self, branch: &str) -> Result<String> {
        let branch = branch.to_string();
        self.blocking(move |inner| inner.branch_head(&branch)).await
    }

    async fn verify_tag(&self, tag: &str) -> Result<Option<String>> {
        let Some(revision) = self.tag_revision(tag).await? else {
            return Ok(None);
        };

        let verified = match self.inner.signing_key {
            Some(_) => self.git(&["verify-tag", tag]).await.map(|_| ()),
            None => self.verify_commit(&revision).await,
        };
        verified.map_err(|e| {
            ReconcilerError::Signature(format!("Tag {} failed verification: {}", tag, e))
        })?;

        Ok(Some(revision))
    }

    async fn commits_between(&self, from: &str, to: &str, paths: &[String]) -> Result<Vec<Commit>> {
        let range = if from.is_empty() {
            to.to_string()
        } else {
            format!("{}..{}", from, to)
        };

        let mut args = vec!["log", "--pretty=format:%GK|%G?|%H", range.as_str()];
        if !paths.is_empty() {
            args.push("--");
            args.extend(paths.iter().map(String::as_str));
        }

        let output = self.git(&args).await?;
        parse_log(&output)
    }
}

#[async_trait]
impl SyncTagStore for GitMirror {
    async fn tag_revision(&self, tag: &str) -> Result<Option<String>> {
        let tag = tag.to_string();
        self.blocking(move |inner| inner.tag_revision(&tag)).await
    }

    async fn move_tag(&self, tag: &str, revision: &str) -> Result<()> {
        match self.inner.signing_key.as_deref() {
            Some(key) => self.write_signed_tag(key, tag, revision).await?,
            None => {
                let (tag, revision) = (tag.to_string(), revision.to_string());
                self.blocking(move |inner| inner.write_tag(&tag, &revision))
                    .await?
            }
        }

        let name = tag.to_string();
        self.blocking(move |inner| inner.push_tag(&name)).await?;

        tracing::info!(
            tag = %tag,
            revision = %revision,
            signed = self.inner.signing_key.is_some(),
            "Pushed sync tag"
        );
        Ok(())
    }
}
