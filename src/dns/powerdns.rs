//! Database-backed DNS driver for PowerDNS.
//!
//! A publish replaces every row of the zone in the [`RecordTable`] as a unit, SOA row
//! included, then asks `pdnsutil check-zone` to validate what the server will now serve. If it
//! is rejected the previous rows are put back. Once accepted, the server's packet cache is
//! purged for the zone so the new serial is visible immediately.

use super::table::{DynRecordTable, RecordRow};
use super::DnsDriver;
use crate::config::{DnsKind, PowerDnsConfig};
use crate::error::{Error, Stage, StageExt};
use crate::model::{DnsRecord, RecordType, ZoneSnapshot};
use crate::publish::Publisher;
use crate::system::CommandSpec;
use std::path::Path;

pub struct PowerDnsDriver {
    config: PowerDnsConfig,
    publisher: Publisher,
    table: DynRecordTable,
}

fn qualify(name: &str, zone: &str) -> String {
    if name == "@" {
        zone.to_string()
    } else {
        format!("{name}.{zone}")
    }
}

fn qualify_target(target: &str, zone: &str) -> String {
    if target.contains('.') {
        target.trim_end_matches('.').to_string()
    } else {
        format!("{target}.{zone}")
    }
}

/// Convert a zone snapshot to table rows.
pub fn to_rows(snapshot: &ZoneSnapshot) -> Vec<RecordRow> {
    let zone = &snapshot.zone.name;
    let soa = snapshot.zone.soa_record();
    let soa_content = soa
        .content
        .split(' ')
        .map(|field| field.trim_end_matches('.'))
        .collect::<Vec<_>>()
        .join(" ");
    let mut rows = vec![RecordRow {
        name: zone.clone(),
        record_type: RecordType::SOA,
        content: soa_content,
        ttl: soa.ttl,
        prio: None,
    }];
    rows.extend(
        snapshot
            .records
            .iter()
            .filter(|r| r.record_type != RecordType::SOA)
            .map(|r| {
                let content = match r.record_type {
                    RecordType::CNAME | RecordType::MX | RecordType::NS | RecordType::PTR => {
                        qualify_target(&r.content, zone)
                    }
                    RecordType::SRV => match r.content.rsplit_once(' ') {
                        Some((rest, target)) => format!("{rest} {}", qualify_target(target, zone)),
                        None => r.content.clone(),
                    },
                    _ => r.content.clone(),
                };
                RecordRow {
                    name: qualify(&r.name, zone),
                    record_type: r.record_type,
                    content,
                    ttl: r.ttl,
                    prio: r.priority,
                }
            }),
    );
    rows
}

/// Convert table rows back to records relative to `zone`.
pub fn from_rows(zone: &str, rows: &[RecordRow]) -> Vec<DnsRecord> {
    rows.iter()
        .map(|row| {
            let content = if row.record_type == RecordType::SOA {
                let mut fields: Vec<String> = row.content.split(' ').map(String::from).collect();
                for name in fields.iter_mut().take(2) {
                    name.push('.');
                }
                fields.join(" ")
            } else {
                row.content.clone()
            };
            DnsRecord {
                id: 0,
                name: super::records::relative_owner(&row.name, zone),
                record_type: row.record_type,
                content,
                ttl: row.ttl,
                priority: row.prio,
            }
        })
        .collect()
}

impl PowerDnsDriver {
    pub fn new(config: PowerDnsConfig, publisher: Publisher, table: DynRecordTable) -> Self {
        Self {
            config,
            publisher,
            table,
        }
    }

    fn check_spec(&self, zone: &str) -> CommandSpec {
        CommandSpec::from_argv(&self.config.check_command, [zone])
    }

    async fn purge(&self, zone: &str) -> Result<(), Error> {
        let purge = CommandSpec::from_argv(&self.config.purge_command, [format!("{zone}$")]);
        self.publisher.reload(zone, &purge, None).await
    }

    /// Swap in the zone's rows, check them, and restore the previous rows if the check fails.
    async fn replace_checked(&self, snapshot: &ZoneSnapshot) -> Result<(), Error> {
        let zone = &snapshot.zone.name;
        let mut table = self.table.write().await;
        let previous = table
            .replace(zone, to_rows(snapshot))
            .await
            .at_stage(Stage::Activate, zone)?;

        let verdict = self.publisher.runner().run(&self.check_spec(zone)).await;
        let failure = match verdict {
            Ok(output) if output.success() => return Ok(()),
            Ok(output) => {
                tracing::warn!("zone {zone} rejected by pdnsutil: {}", output.combined());
                Error::Invalid {
                    target: zone.clone(),
                    output: output.combined(),
                }
            }
            Err(err) => err.at(Stage::Validate, zone),
        };
        let restored = match previous {
            Some(rows) => table.replace(zone, rows).await.map(|_| ()),
            None => table.remove(zone).await.map(|_| ()),
        };
        restored.at_stage(Stage::Activate, zone)?;
        Err(failure)
    }
}

#[async_trait::async_trait]
impl DnsDriver for PowerDnsDriver {
    fn kind(&self) -> DnsKind {
        DnsKind::PowerDns
    }

    async fn create_zone(&self, snapshot: &ZoneSnapshot) -> Result<(), Error> {
        let zone = &snapshot.zone.name;
        self.replace_checked(snapshot).await?;
        tracing::info!("created zone {zone} (serial {})", snapshot.zone.serial);
        self.purge(zone).await
    }

    async fn remove_zone(&self, zone: &str) -> Result<bool, Error> {
        let removed = self
            .table
            .write()
            .await
            .remove(zone)
            .await
            .at_stage(Stage::Activate, zone)?
            .is_some();
        if removed {
            tracing::info!("removed zone {zone}");
            self.purge(zone).await?;
        }
        Ok(removed)
    }

    async fn publish_zone(&self, snapshot: &ZoneSnapshot) -> Result<(), Error> {
        let zone = &snapshot.zone.name;
        self.replace_checked(snapshot).await?;
        tracing::info!("published zone {zone} (serial {})", snapshot.zone.serial);
        self.purge(zone).await
    }

    async fn records(&self, zone: &str) -> Result<Option<Vec<DnsRecord>>, Error> {
        let rows = self.table.read().await.rows(zone).await?;
        Ok(rows.map(|rows| from_rows(zone, &rows)))
    }

    async fn reload(&self) -> Result<(), Error> {
        let reload = CommandSpec::from_argv(&self.config.reload_command, Vec::<String>::new());
        self.publisher.reload("powerdns", &reload, None).await
    }

    async fn check_zone(&self, name: &str, _path: &Path) -> Result<bool, Error> {
        self.publisher.check(name, &self.check_spec(name)).await
    }
}
