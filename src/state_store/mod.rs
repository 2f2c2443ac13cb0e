//! Control-plane persistence.
//!
//! The state store holds the canonical [`Domain`], [`DnsZone`], [`DnsRecord`] and
//! [`SslCertificate`] records. Drivers never read it: everything they write is derived from what
//! the [orchestrator][crate::orchestrator] hands them, so every external artifact can be rebuilt
//! from this store.
//!
//! Two implementations are provided, [`memory::MemoryStateStore`] and [`file::FileStateStore`].
//! The former is not durable across restarts. The latter writes its state to disk after each
//! update and loads it again on startup.

use crate::error::Error;
use crate::model::{DnsRecord, DnsZone, Domain, SslCertificate};
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

/// `DynStateStore` is a type alias for a [`StateStore`] that can be used by multiple read/write
/// consumers that coordinate through an [`Arc`] and a [`RwLock`] wrapping the [`StateStore`].
pub type DynStateStore = Arc<RwLock<dyn StateStore + Send + Sync>>;

/// An async trait describing the persistence store. The store owns record identity (record ids)
/// and timestamps.
#[async_trait::async_trait]
pub trait StateStore {
    async fn domain(&self, name: &str) -> Option<Domain>;

    async fn domains(&self) -> Vec<Domain>;

    /// Insert or replace a domain, stamping `created_at`/`updated_at`.
    async fn put_domain(&mut self, domain: Domain) -> Result<Domain, Error>;

    /// Remove a domain and cascade to its zone, records and certificate. Returns `false` if
    /// there was nothing to remove.
    async fn remove_domain(&mut self, name: &str) -> Result<bool, Error>;

    async fn zone(&self, name: &str) -> Option<DnsZone>;

    async fn records(&self, zone: &str) -> Vec<DnsRecord>;

    /// Replace a zone and its full record set as one unit. Records with a zero id are assigned
    /// a fresh one. Returns the stored records.
    async fn put_zone(
        &mut self,
        zone: DnsZone,
        records: Vec<DnsRecord>,
    ) -> Result<Vec<DnsRecord>, Error>;

    async fn remove_zone(&mut self, name: &str) -> Result<bool, Error>;

    async fn certificate(&self, domain: &str) -> Option<SslCertificate>;

    async fn certificates(&self) -> Vec<SslCertificate>;

    /// Insert or replace the certificate for `certificate.domain`. A domain has at most one.
    async fn put_certificate(&mut self, certificate: SslCertificate) -> Result<(), Error>;

    async fn remove_certificate(&mut self, domain: &str) -> Result<bool, Error>;
}
