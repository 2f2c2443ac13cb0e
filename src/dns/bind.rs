//! File-based DNS driver for BIND.
//!
//! Each zone is one master file, `<zone_dir>/<zone>.db`, plus a `<zone_dir>/<zone>.conf`
//! stanza declaring it. The server's configuration includes a single index file that in turn
//! includes every stanza. The index is regenerated from the directory listing whenever the set
//! of zones changes, followed by `rndc reconfig`; record changes only need `rndc reload <zone>`.
//!
//! The index is the record of what the server has been told about. If `rndc reconfig` fails the
//! previous index is put back, so a zone counts as declared only once a reconfig including it
//! succeeded, and a retry of a failed create or remove reconfigures again.

use super::{zonefile, DnsDriver};
use crate::config::{BindConfig, DnsKind};
use crate::error::{Error, Stage, StageExt};
use crate::model::{DnsRecord, ZoneSnapshot};
use crate::publish::{staged_path, Publisher};
use crate::system::CommandSpec;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

pub struct BindDriver {
    config: BindConfig,
    publisher: Publisher,
    /// Held while the index is regenerated and the server reconfigured.
    index_lock: Mutex<()>,
}

impl BindDriver {
    pub fn new(config: BindConfig, publisher: Publisher) -> Self {
        Self {
            config,
            publisher,
            index_lock: Mutex::new(()),
        }
    }

    pub fn zone_path(&self, zone: &str) -> PathBuf {
        self.config.zone_dir.join(format!("{zone}.db"))
    }

    pub fn stanza_path(&self, zone: &str) -> PathBuf {
        self.config.zone_dir.join(format!("{zone}.conf"))
    }

    fn stanza(&self, zone: &str) -> String {
        format!(
            "zone \"{zone}\" {{\n\ttype master;\n\tfile \"{}\";\n}};\n",
            self.zone_path(zone).display()
        )
    }

    fn check_spec(&self, zone: &str, path: &Path) -> CommandSpec {
        CommandSpec::from_argv(
            &self.config.check_command,
            [zone.to_string(), path.display().to_string()],
        )
    }

    async fn write_zone_file(&self, snapshot: &ZoneSnapshot) -> Result<(), Error> {
        let zone = &snapshot.zone.name;
        let text = zonefile::render(snapshot);
        self.publisher
            .publish_staged(zone, &self.zone_path(zone), &text, |staged| {
                self.check_spec(zone, staged)
            })
            .await
    }

    fn index_line(&self, zone: &str) -> String {
        format!("include \"{}\";", self.stanza_path(zone).display())
    }

    /// Whether the last successfully applied index includes `zone`.
    async fn declared(&self, zone: &str) -> Result<bool, Error> {
        let index = self
            .publisher
            .artifacts()
            .read(&self.config.index_path)
            .await
            .at_stage(Stage::Activate, zone)?;
        let line = self.index_line(zone);
        Ok(index.is_some_and(|index| index.lines().any(|l| l == line)))
    }

    /// Rebuild the index from every stanza in `zone_dir`, leaving out `zone` when `removing`,
    /// and ask the server to pick up the new zone set. If the server refuses, the previous
    /// index is restored.
    async fn reconfigure(&self, zone: &str, removing: bool) -> Result<(), Error> {
        let _guard = self.index_lock.lock().await;
        let artifacts = self.publisher.artifacts();
        let excluded = self.stanza_path(zone);
        let mut stanzas: Vec<PathBuf> = artifacts
            .list(&self.config.zone_dir)
            .await
            .at_stage(Stage::Activate, zone)?
            .into_iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "conf"))
            .filter(|p| !(removing && *p == excluded))
            .collect();
        stanzas.sort();

        let mut index = String::from("// Managed by hostcrab. Regenerated on every zone change.\n");
        for stanza in &stanzas {
            index.push_str(&format!("include \"{}\";\n", stanza.display()));
        }
        let previous = artifacts
            .read(&self.config.index_path)
            .await
            .at_stage(Stage::Activate, zone)?;
        let staged = staged_path(&self.config.index_path);
        artifacts
            .write(&staged, &index, None)
            .await
            .at_stage(Stage::Render, zone)?;
        artifacts
            .rename(&staged, &self.config.index_path)
            .await
            .at_stage(Stage::Activate, zone)?;
        tracing::debug!(
            "regenerated {} with {} zones",
            self.config.index_path.display(),
            stanzas.len()
        );

        let reconfig = CommandSpec::from_argv(&self.config.reconfig_command, Vec::<String>::new());
        let Err(err) = self.publisher.reload(zone, &reconfig, None).await else {
            return Ok(());
        };
        tracing::warn!("reconfig for {zone} failed, restoring the previous index");
        let restored = match previous {
            Some(previous) => artifacts.write(&self.config.index_path, &previous, None).await,
            None => artifacts.remove(&self.config.index_path).await.map(|_| ()),
        };
        if let Err(restore_err) = restored {
            let index = self.config.index_path.display();
            tracing::error!("failed to restore {index}: {restore_err}");
        }
        Err(err)
    }

    async fn reload_zone(&self, zone: &str) -> Result<(), Error> {
        let reload = CommandSpec::from_argv(&self.config.reload_command, [zone]);
        self.publisher.reload(zone, &reload, None).await
    }
}

#[async_trait::async_trait]
impl DnsDriver for BindDriver {
    fn kind(&self) -> DnsKind {
        DnsKind::Bind
    }

    async fn create_zone(&self, snapshot: &ZoneSnapshot) -> Result<(), Error> {
        let zone = &snapshot.zone.name;
        self.write_zone_file(snapshot).await?;

        if self.declared(zone).await? {
            tracing::info!("zone {zone} already declared, reloading");
            return self.reload_zone(zone).await;
        }
        self.publisher
            .artifacts()
            .write(&self.stanza_path(zone), &self.stanza(zone), None)
            .await
            .at_stage(Stage::Activate, zone)?;
        tracing::info!("created zone {zone} (serial {})", snapshot.zone.serial);
        self.reconfigure(zone, false).await
    }

    async fn remove_zone(&self, zone: &str) -> Result<bool, Error> {
        // The server has to forget the zone before its files go away.
        let declared = self.declared(zone).await?;
        if declared {
            self.reconfigure(zone, true).await?;
        }
        let artifacts = self.publisher.artifacts();
        let had_stanza = artifacts
            .remove(&self.stanza_path(zone))
            .await
            .at_stage(Stage::Activate, zone)?;
        let had_file = artifacts
            .remove(&self.zone_path(zone))
            .await
            .at_stage(Stage::Activate, zone)?;
        let removed = declared || had_stanza || had_file;
        if removed {
            tracing::info!("removed zone {zone}");
        }
        Ok(removed)
    }

    async fn publish_zone(&self, snapshot: &ZoneSnapshot) -> Result<(), Error> {
        let zone = &snapshot.zone.name;
        self.write_zone_file(snapshot).await?;
        tracing::info!("published zone {zone} (serial {})", snapshot.zone.serial);
        self.reload_zone(zone).await
    }

    async fn records(&self, zone: &str) -> Result<Option<Vec<DnsRecord>>, Error> {
        let Some(text) = self.publisher.artifacts().read(&self.zone_path(zone)).await? else {
            return Ok(None);
        };
        zonefile::parse(zone, &text).map(Some)
    }

    async fn reload(&self) -> Result<(), Error> {
        let reload = CommandSpec::from_argv(&self.config.reload_command, Vec::<String>::new());
        self.publisher.reload("bind", &reload, None).await
    }

    async fn check_zone(&self, name: &str, path: &Path) -> Result<bool, Error> {
        self.publisher.check(name, &self.check_spec(name, path)).await
    }
}
