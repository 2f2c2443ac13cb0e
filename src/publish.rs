//! The generate → validate → activate → reload procedure shared by every driver.
//!
//! Two validation strategies are offered:
//!
//! * [`Publisher::publish_staged`] for artifacts the backend can check on their own (zone
//!   files): the artifact is written next to its definitive path, checked there, and only
//!   renamed into place once the checker accepts it.
//! * [`Publisher::apply_checked`] for daemons whose checker validates the whole configuration
//!   tree (Apache, Nginx): a [`Changeset`] is applied in place after snapshotting every path it
//!   touches, the checker runs, and every path is restored if it fails.
//!
//! Either way an invalid artifact is never left at its definitive path and the daemon is never
//! reloaded against it. Reloading is a separate step, [`Publisher::reload`], that callers only
//! reach after a successful publish.

use crate::error::{Error, Stage, StageExt};
use crate::system::{CommandSpec, DynArtifacts, DynRunner};
use std::path::{Path, PathBuf};

/// One change to the artifact tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Write {
        path: PathBuf,
        contents: String,
        mode: Option<u32>,
    },
    Remove(PathBuf),
    Link {
        target: PathBuf,
        link: PathBuf,
    },
    Unlink(PathBuf),
}

/// An ordered set of changes applied, and if necessary rolled back, as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    changes: Vec<Change>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn write(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.changes.push(Change::Write {
            path: path.into(),
            contents: contents.into(),
            mode: None,
        });
        self
    }

    #[must_use]
    pub fn write_private(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.changes.push(Change::Write {
            path: path.into(),
            contents: contents.into(),
            mode: Some(0o600),
        });
        self
    }

    #[must_use]
    pub fn remove(mut self, path: impl Into<PathBuf>) -> Self {
        self.changes.push(Change::Remove(path.into()));
        self
    }

    #[must_use]
    pub fn link(mut self, target: impl Into<PathBuf>, link: impl Into<PathBuf>) -> Self {
        self.changes.push(Change::Link {
            target: target.into(),
            link: link.into(),
        });
        self
    }

    #[must_use]
    pub fn unlink(mut self, link: impl Into<PathBuf>) -> Self {
        self.changes.push(Change::Unlink(link.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }
}

#[derive(Debug)]
struct PriorFile {
    contents: String,
    mode: Option<u32>,
}

#[derive(Debug)]
enum Prior {
    File(Option<PriorFile>),
    Link(Option<PathBuf>),
}

/// A changeset that has been applied. Holds the prior state of every touched path.
#[must_use = "an applied changeset should be kept or rolled back"]
pub struct Applied<'a> {
    publisher: &'a Publisher,
    target: String,
    undo: Vec<(Change, Prior)>,
    changed: bool,
}

impl Applied<'_> {
    /// Whether applying changed anything at all.
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Restore every touched path to its state before the changeset was applied, in reverse
    /// order.
    pub async fn rollback(self) -> Result<(), Error> {
        let artifacts = &self.publisher.artifacts;
        for (change, prior) in self.undo.into_iter().rev() {
            let res = match (change, prior) {
                (Change::Write { path, mode, .. }, Prior::File(prior)) => match prior {
                    Some(prior) => {
                        let mode = prior.mode.or(mode);
                        artifacts.write(&path, &prior.contents, mode).await
                    }
                    None => artifacts.remove(&path).await.map(|_| ()),
                },
                (Change::Remove(path), Prior::File(prior)) => match prior {
                    // Restored files get their old permissions back, private keys included.
                    Some(prior) => artifacts.write(&path, &prior.contents, prior.mode).await,
                    None => Ok(()),
                },
                (Change::Link { link, .. } | Change::Unlink(link), Prior::Link(prior)) => {
                    match prior {
                        Some(target) => artifacts.symlink(&target, &link).await,
                        None => artifacts.unlink(&link).await.map(|_| ()),
                    }
                }
                _ => Ok(()),
            };
            res.at_stage(Stage::Activate, &self.target)?;
        }
        tracing::info!("rolled back changes to {}", self.target);
        Ok(())
    }
}

pub struct Publisher {
    artifacts: DynArtifacts,
    runner: DynRunner,
}

impl Publisher {
    pub fn new(artifacts: DynArtifacts, runner: DynRunner) -> Self {
        Self { artifacts, runner }
    }

    pub fn artifacts(&self) -> &DynArtifacts {
        &self.artifacts
    }

    pub fn runner(&self) -> &DynRunner {
        &self.runner
    }

    /// Write `contents` to a staging path beside `path`, run the checker built by `check`
    /// against the staged file, and rename it over `path` only if the checker accepts it.
    pub async fn publish_staged<F>(
        &self,
        target: &str,
        path: &Path,
        contents: &str,
        check: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&Path) -> CommandSpec,
    {
        let staged = staged_path(path);
        self.artifacts
            .write(&staged, contents, None)
            .await
            .at_stage(Stage::Render, target)?;

        let spec = check(&staged);
        let verdict = self.runner.run(&spec).await;
        let output = match verdict {
            Ok(output) => output,
            Err(err) => {
                self.discard(&staged).await;
                return Err(err.at(Stage::Validate, target));
            }
        };
        if !output.success() {
            self.discard(&staged).await;
            tracing::warn!("{target} rejected by `{spec}`: {}", output.combined());
            return Err(Error::Invalid {
                target: target.to_string(),
                output: output.combined(),
            });
        }

        self.artifacts
            .rename(&staged, path)
            .await
            .at_stage(Stage::Activate, target)?;
        tracing::debug!("published {}", path.display());
        Ok(())
    }

    async fn discard(&self, staged: &Path) {
        if let Err(err) = self.artifacts.remove(staged).await {
            tracing::warn!("failed to remove {}: {err}", staged.display());
        }
    }

    /// Apply a changeset without validation. On a partial failure the changes made so far are
    /// rolled back before the error is returned.
    pub async fn apply(&self, target: &str, changeset: Changeset) -> Result<Applied<'_>, Error> {
        let mut applied = Applied {
            publisher: self,
            target: target.to_string(),
            undo: Vec::with_capacity(changeset.changes.len()),
            changed: false,
        };
        for change in changeset.changes {
            match self.apply_one(&change).await {
                Ok((prior, changed)) => {
                    applied.changed |= changed;
                    applied.undo.push((change, prior));
                }
                Err(err) => {
                    if let Err(rollback_err) = applied.rollback().await {
                        tracing::error!("rollback of {target} failed: {rollback_err}");
                    }
                    return Err(err.at(Stage::Activate, target));
                }
            }
        }
        Ok(applied)
    }

    async fn apply_one(&self, change: &Change) -> Result<(Prior, bool), Error> {
        let artifacts = &self.artifacts;
        match change {
            Change::Write {
                path,
                contents,
                mode,
            } => {
                let prior = self.prior_file(path).await?;
                let changed =
                    prior.as_ref().map(|p| p.contents.as_str()) != Some(contents.as_str());
                if changed {
                    artifacts.write(path, contents, *mode).await?;
                }
                Ok((Prior::File(prior), changed))
            }
            Change::Remove(path) => {
                let prior = self.prior_file(path).await?;
                let changed = artifacts.remove(path).await?;
                Ok((Prior::File(prior), changed))
            }
            Change::Link { target, link } => {
                let prior = artifacts.link_target(link).await?;
                let changed = prior.as_deref() != Some(target.as_path());
                if changed {
                    artifacts.symlink(target, link).await?;
                }
                Ok((Prior::Link(prior), changed))
            }
            Change::Unlink(link) => {
                let prior = artifacts.link_target(link).await?;
                let changed = artifacts.unlink(link).await?;
                Ok((Prior::Link(prior), changed))
            }
        }
    }

    async fn prior_file(&self, path: &Path) -> Result<Option<PriorFile>, Error> {
        let Some(contents) = self.artifacts.read(path).await? else {
            return Ok(None);
        };
        let mode = self.artifacts.permissions(path).await?;
        Ok(Some(PriorFile { contents, mode }))
    }

    /// Apply a changeset, then run the tree-wide checker `check`. If the checker rejects the
    /// result, every touched path is restored and [`Error::Invalid`] is returned. Returns
    /// `false` without running the checker if the changeset changed nothing.
    pub async fn apply_checked(
        &self,
        target: &str,
        changeset: Changeset,
        check: &CommandSpec,
    ) -> Result<bool, Error> {
        let applied = self.apply(target, changeset).await?;
        if !applied.changed() {
            return Ok(false);
        }
        let failure = match self.runner.run(check).await {
            Ok(output) if output.success() => return Ok(true),
            Ok(output) => {
                tracing::warn!("{target} rejected by `{check}`: {}", output.combined());
                Error::Invalid {
                    target: target.to_string(),
                    output: output.combined(),
                }
            }
            Err(err) => err.at(Stage::Validate, target),
        };
        applied.rollback().await?;
        Err(failure)
    }

    /// Run a checker against the live configuration.
    pub async fn check(&self, target: &str, check: &CommandSpec) -> Result<bool, Error> {
        let output = self
            .runner
            .run(check)
            .await
            .at_stage(Stage::Validate, target)?;
        if !output.success() {
            tracing::warn!("`{check}` failed: {}", output.combined());
        }
        Ok(output.success())
    }

    /// Signal the daemon to reload. If reloading fails and a `restart` command is given, fall
    /// back to a full restart.
    pub async fn reload(
        &self,
        target: &str,
        reload: &CommandSpec,
        restart: Option<&CommandSpec>,
    ) -> Result<(), Error> {
        let reload_err = match self.runner.run(reload).await.and_then(|o| o.check(reload)) {
            Ok(_) => {
                tracing::debug!("reloaded for {target}");
                return Ok(());
            }
            Err(err) => err,
        };
        let Some(restart) = restart else {
            return Err(reload_err.at(Stage::Reload, target));
        };
        tracing::warn!("`{reload}` failed ({reload_err}), falling back to `{restart}`");
        self.runner
            .run(restart)
            .await
            .and_then(|o| o.check(restart))
            .at_stage(Stage::Reload, target)?;
        Ok(())
    }
}

/// `<path>.staged`, beside the definitive path so the final rename stays on one filesystem.
pub fn staged_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_owned();
    staged.push(".staged");
    PathBuf::from(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{ArtifactStore, CommandOutput, MemoryArtifacts};
    use crate::test_utils::ScriptedRunner;
    use std::sync::Arc;

    fn publisher(runner: Arc<ScriptedRunner>) -> (Publisher, Arc<MemoryArtifacts>) {
        let artifacts = Arc::new(MemoryArtifacts::default());
        (Publisher::new(artifacts.clone(), runner), artifacts)
    }

    fn checkzone(path: &Path) -> CommandSpec {
        CommandSpec::from_argv(
            &["named-checkzone".to_string()],
            ["example.com".to_string(), path.display().to_string()],
        )
    }

    #[tokio::test]
    async fn staged_publish_renames_valid_artifact() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let (publisher, artifacts) = publisher(runner.clone());
        let live = Path::new("/zones/example.com.db");

        publisher
            .publish_staged("example.com", live, "valid zone", checkzone)
            .await
            .unwrap();

        assert_eq!(artifacts.contents(live).as_deref(), Some("valid zone"));
        assert_eq!(artifacts.contents(&staged_path(live)), None);
        assert_eq!(
            runner.calls()[0].args,
            vec!["example.com", "/zones/example.com.db.staged"]
        );
    }

    #[tokio::test]
    async fn staged_publish_leaves_live_artifact_untouched_when_invalid() {
        let artifacts = Arc::new(MemoryArtifacts::default());
        let live = Path::new("/zones/example.com.db");
        artifacts.write(live, "previous zone", None).await.unwrap();
        let inspect = artifacts.clone();
        let runner = Arc::new(ScriptedRunner::new(move |spec| {
            let staged = Path::new(spec.args.last().map(String::as_str).unwrap_or_default());
            match inspect.contents(staged) {
                Some(c) if c.contains("broken") => CommandOutput::failed(1, "bad owner name"),
                _ => CommandOutput::ok(""),
            }
        }));
        let publisher = Publisher::new(artifacts.clone(), runner);

        let err = publisher
            .publish_staged("example.com", live, "broken zone", checkzone)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Invalid { .. }));
        assert_eq!(err.stage(), Some(Stage::Validate));
        assert_eq!(artifacts.contents(live).as_deref(), Some("previous zone"));
        assert_eq!(artifacts.files(), vec![live.to_path_buf()]);
    }

    #[tokio::test]
    async fn apply_checked_restores_every_path_on_rejection() {
        let runner = Arc::new(ScriptedRunner::new(|_| CommandOutput::failed(1, "Syntax error")));
        let (publisher, artifacts) = publisher(runner);
        let available = Path::new("/sites-available/example.com.conf");
        let enabled = Path::new("/sites-enabled/example.com.conf");
        let old_ssl = Path::new("/sites-available/example.com-ssl.conf");
        artifacts.write(old_ssl, "old ssl", None).await.unwrap();

        let changes = Changeset::new()
            .write(available, "vhost")
            .link(available, enabled)
            .remove(old_ssl);
        let check = CommandSpec::from_argv(&["apache2ctl".to_string()], ["configtest"]);
        let err = publisher
            .apply_checked("example.com", changes, &check)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Invalid { .. }));
        assert_eq!(artifacts.contents(available), None);
        assert!(!artifacts.is_linked(enabled));
        assert_eq!(artifacts.contents(old_ssl).as_deref(), Some("old ssl"));
    }

    #[tokio::test]
    async fn rollback_restores_removed_key_as_private() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let (publisher, artifacts) = publisher(runner);
        let key = Path::new("/ssl/example.com/privkey.pem");
        let cert = Path::new("/ssl/example.com/cert.pem");
        artifacts.write(key, "old key", Some(0o600)).await.unwrap();
        artifacts.write(cert, "old cert", None).await.unwrap();

        let applied = publisher
            .apply("example.com", Changeset::new().remove(key).write(cert, "new cert"))
            .await
            .unwrap();
        assert_eq!(artifacts.contents(key), None);
        applied.rollback().await.unwrap();

        assert_eq!(artifacts.contents(key).as_deref(), Some("old key"));
        assert_eq!(artifacts.mode(key), Some(0o600));
        assert_eq!(artifacts.contents(cert).as_deref(), Some("old cert"));
        assert_eq!(artifacts.mode(cert), None);
    }

    #[tokio::test]
    async fn apply_checked_skips_checker_when_nothing_changes() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let (publisher, _) = publisher(runner.clone());
        let changes = Changeset::new()
            .unlink("/sites-enabled/gone.conf")
            .remove("/sites-available/gone.conf");
        let check = CommandSpec::from_argv(&["nginx".to_string()], ["-t"]);
        assert!(!publisher.apply_checked("gone", changes, &check).await.unwrap());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn reload_falls_back_to_restart() {
        let runner = Arc::new(ScriptedRunner::new(|spec| {
            if spec.args.first().map(String::as_str) == Some("reload") {
                CommandOutput::failed(1, "Job for apache2.service failed")
            } else {
                CommandOutput::ok("")
            }
        }));
        let (publisher, _) = publisher(runner.clone());
        let reload = CommandSpec::from_argv(&["systemctl".to_string()], ["reload", "apache2"]);
        let restart = CommandSpec::from_argv(&["systemctl".to_string()], ["restart", "apache2"]);

        publisher
            .reload("example.com", &reload, Some(&restart))
            .await
            .unwrap();
        assert_eq!(runner.calls().len(), 2);

        let err = publisher
            .reload("example.com", &reload, None)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Reload));
    }
}
