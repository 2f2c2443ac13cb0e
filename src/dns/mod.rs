//! DNS zone publishing.
//!
//! # Drivers
//!
//! A [`DnsDriver`] publishes the zones the [orchestrator][crate::orchestrator] hands it to one
//! kind of DNS server. The driver is picked once, at startup, from
//! [`Config::dns`][crate::config::Config::dns]:
//!
//! ```json
//! { "dns": { "kind": "bind", "zone_dir": "/etc/bind/zones" } }
//! ```
//!
//! * [`bind::BindDriver`] writes one master file per zone and validates it with
//!   `named-checkzone` before it is moved into place.
//! * [`powerdns::PowerDnsDriver`] replaces the zone's rows in a [`table::RecordTable`] and
//!   validates them with `pdnsutil check-zone`, restoring the previous rows if they are
//!   rejected.
//!
//! Drivers are always handed the zone's complete record set and republish it in full. They
//! keep no state of their own beyond the artifacts they write.
//!
//! # Serials
//!
//! Every change to a zone is published under a new serial from [`serial::next_serial`],
//! allocated before the zone is rendered. A zone created on 18 October 2026 starts at
//! `2026101801`; its next change that day is published as `2026101802`.
//!
//! # Default records
//!
//! New zones start with [`records::ZoneTemplate::records`]: an `NS` record per configured
//! nameserver, `A` records for `@`, `www` and `mail` pointing at
//! [`Config::server_ip`][crate::config::Config::server_ip] (plus `AAAA` records for `@` and
//! `www` when an IPv6 address is configured), an `MX` record for `mail.<domain>` and an SPF
//! `TXT` record.

pub mod bind;
pub mod powerdns;
pub mod records;
pub mod serial;
pub mod table;
pub mod zonefile;

use crate::config::{Config, DnsConfig, DnsKind};
use crate::error::Error;
use crate::model::{DnsRecord, ZoneSnapshot};
use crate::publish::Publisher;
use crate::system::{DynArtifacts, DynRunner};
use std::path::Path;
use std::sync::Arc;
use table::{DynRecordTable, SqlRecordTable};
use tokio::sync::RwLock;

pub use records::ZoneTemplate;

pub type DynDnsDriver = Arc<dyn DnsDriver + Send + Sync>;

/// The operations every DNS backend supports.
///
/// Every mutating operation either leaves the server serving what the previous successful
/// call published, or fails. A zone that fails validation is never activated.
///
/// The record operations receive the zone's full post-change snapshot along with the record
/// that changed; by default they republish the whole zone.
#[async_trait::async_trait]
pub trait DnsDriver {
    fn kind(&self) -> DnsKind;

    /// Publish a new zone and register it with the server. Publishing a zone the server
    /// already knows republishes it.
    async fn create_zone(&self, snapshot: &ZoneSnapshot) -> Result<(), Error>;

    /// Remove a zone and everything published for it. Returns `false` if there was nothing to
    /// remove.
    async fn remove_zone(&self, zone: &str) -> Result<bool, Error>;

    /// Republish a zone from its complete record set.
    async fn publish_zone(&self, snapshot: &ZoneSnapshot) -> Result<(), Error>;

    async fn reset_zone(&self, snapshot: &ZoneSnapshot) -> Result<(), Error> {
        tracing::info!("resetting zone {}", snapshot.zone.name);
        self.publish_zone(snapshot).await
    }

    async fn add_record(&self, snapshot: &ZoneSnapshot, record: &DnsRecord) -> Result<(), Error> {
        tracing::info!(
            "adding {} {} to {}",
            record.name,
            record.record_type,
            snapshot.zone.name
        );
        self.publish_zone(snapshot).await
    }

    async fn update_record(
        &self,
        snapshot: &ZoneSnapshot,
        record: &DnsRecord,
    ) -> Result<(), Error> {
        tracing::info!(
            "updating record {} ({} {}) in {}",
            record.id,
            record.name,
            record.record_type,
            snapshot.zone.name
        );
        self.publish_zone(snapshot).await
    }

    async fn remove_record(
        &self,
        snapshot: &ZoneSnapshot,
        record: &DnsRecord,
    ) -> Result<(), Error> {
        tracing::info!(
            "removing {} {} from {}",
            record.name,
            record.record_type,
            snapshot.zone.name
        );
        self.publish_zone(snapshot).await
    }

    /// The records the server is currently configured to serve for `zone`, SOA included, or
    /// `None` if the zone isn't published.
    async fn records(&self, zone: &str) -> Result<Option<Vec<DnsRecord>>, Error>;

    /// Reload the whole server.
    async fn reload(&self) -> Result<(), Error>;

    /// Run the backend's checker for zone `name`. `path` is the master file to check, for
    /// backends that have one.
    async fn check_zone(&self, name: &str, path: &Path) -> Result<bool, Error>;
}

/// Build the configured DNS driver.
///
/// # Errors
///
/// Returns an error if the PowerDNS database can't be reached.
pub async fn from_config(
    config: &Config,
    artifacts: DynArtifacts,
    runner: DynRunner,
) -> Result<DynDnsDriver, Error> {
    let publisher = Publisher::new(artifacts, runner);
    Ok(match &config.dns {
        DnsConfig::Bind(bind) => Arc::new(bind::BindDriver::new(bind.clone(), publisher)),
        DnsConfig::PowerDns(pdns) => {
            let table: DynRecordTable =
                Arc::new(RwLock::new(SqlRecordTable::connect(&pdns.database_url).await?));
            Arc::new(powerdns::PowerDnsDriver::new(pdns.clone(), publisher, table))
        }
    })
}
