//! The orchestration facade.
//!
//! [`Orchestrator`] composes the state store, the DNS and web server drivers and the
//! certificate manager into the operations a hosting panel triggers: provisioning and
//! deprovisioning a domain, editing its zone, managing subdomains, suspension, certificates and
//! the renewal sweep.
//!
//! Every operation on a domain holds that domain's [lock][crate::locks::DomainLocks] for its
//! whole duration. Workflows that span several systems are not rolled back across systems when
//! a later step fails; the reports say how far they got, and every step can be re-run.

use crate::clock::DynClock;
use crate::config::Config;
use crate::dns::records::{ensure_removable, validate_record, validate_record_set};
use crate::dns::serial::{initial_serial, next_serial};
use crate::dns::{DynDnsDriver, ZoneTemplate};
use crate::error::{Error, Stage};
use crate::locks::DomainLocks;
use crate::model::{
    CertState, DnsRecord, DnsZone, Domain, RecordType, SslCertificate, Subdomain, ZoneSnapshot,
};
use crate::notify::{DynNotifier, Event};
use crate::publish::Publisher;
use crate::state_store::{DynStateStore, FileStateStore, MemoryStateStore};
use crate::system::{DynArtifacts, DynRunner};
use crate::tls::acme::CertificateMaterial;
use crate::tls::seal::KeySealer;
use crate::tls::{select_for_renewal, CertificateManager, RenewalFailure};
use crate::web::DynWebServerDriver;
use crate::{dns, tls, web};
use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The outcome of one provisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    Skipped,
    Failed {
        stage: Option<Stage>,
        message: String,
    },
}

impl StepOutcome {
    fn failed(err: &Error) -> Self {
        StepOutcome::Failed {
            stage: err.stage(),
            message: describe(err),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub domain: String,
    pub zone: StepOutcome,
    pub virtual_host: StepOutcome,
    pub certificate: StepOutcome,
}

impl ProvisionReport {
    /// Whether no step failed.
    pub fn is_complete(&self) -> bool {
        !(self.zone.is_failed() || self.virtual_host.is_failed() || self.certificate.is_failed())
    }
}

/// The outcome of one deprovisioning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemovalOutcome {
    Removed,
    Absent,
    Failed {
        stage: Option<Stage>,
        message: String,
    },
}

impl RemovalOutcome {
    fn from_result(res: Result<bool, Error>) -> Self {
        match res {
            Ok(true) => RemovalOutcome::Removed,
            Ok(false) => RemovalOutcome::Absent,
            Err(err) => RemovalOutcome::Failed {
                stage: err.stage(),
                message: describe(&err),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RemovalOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeprovisionReport {
    pub domain: String,
    pub virtual_host: RemovalOutcome,
    pub zone: RemovalOutcome,
    pub certificate: RemovalOutcome,
}

impl DeprovisionReport {
    pub fn is_complete(&self) -> bool {
        !(self.virtual_host.is_failed() || self.zone.is_failed() || self.certificate.is_failed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub domain: String,
    pub reason: String,
}

/// What a renewal sweep selected and what became of each candidate. A dry run only fills in
/// `candidates`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub candidates: Vec<String>,
    pub renewed: Vec<String>,
    pub failed: Vec<SweepFailure>,
}

/// A change to a zone's record set, naming the driver operation that publishes it.
enum ZoneChange<'a> {
    Add(&'a DnsRecord),
    Update(&'a DnsRecord),
    Remove(&'a DnsRecord),
    Reset,
    Republish,
}

/// The error and its chain of causes on one line.
fn describe(err: &Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub struct Orchestrator {
    store: DynStateStore,
    dns: DynDnsDriver,
    web: DynWebServerDriver,
    certificates: CertificateManager,
    template: ZoneTemplate,
    clock: DynClock,
    notifier: DynNotifier,
    locks: DomainLocks,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: DynStateStore,
        dns: DynDnsDriver,
        web: DynWebServerDriver,
        certificates: CertificateManager,
        template: ZoneTemplate,
        clock: DynClock,
        notifier: DynNotifier,
    ) -> Self {
        Self {
            store,
            dns,
            web,
            certificates,
            template,
            clock,
            notifier,
            locks: DomainLocks::new(),
        }
    }

    /// Assemble an orchestrator with the drivers, store and ACME transport selected by
    /// `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file or PowerDNS record table can't be loaded, or if the
    /// configuration is unusable.
    pub async fn from_config(
        config: &Config,
        artifacts: DynArtifacts,
        runner: DynRunner,
        clock: DynClock,
        notifier: DynNotifier,
    ) -> Result<Self, Error> {
        let store: DynStateStore = match &config.state_path {
            Some(path) => Arc::new(RwLock::new(FileStateStore::try_from_file(path).await?)),
            None => Arc::new(RwLock::new(MemoryStateStore::default())),
        };
        let dns = dns::from_config(config, artifacts.clone(), runner.clone()).await?;
        let web = web::from_config(config, artifacts.clone(), runner.clone());
        let transport =
            tls::acme::from_config(config, runner.clone(), artifacts.clone(), clock.clone());
        let certificates = CertificateManager::new(
            config.tls.ssl_dir.clone(),
            config.tls.renew_before_days,
            config.tls.acme_timeout,
            transport,
            KeySealer::new(&config.tls.seal_key_bytes()?)?,
            Publisher::new(artifacts, runner),
            web.clone(),
            clock.clone(),
        );
        Ok(Self::new(
            store,
            dns,
            web,
            certificates,
            ZoneTemplate::from_config(config)?,
            clock,
            notifier,
        ))
    }

    pub fn web(&self) -> &DynWebServerDriver {
        &self.web
    }

    pub fn dns(&self) -> &DynDnsDriver {
        &self.dns
    }

    pub fn store(&self) -> &DynStateStore {
        &self.store
    }

    pub async fn domain(&self, name: &str) -> Option<Domain> {
        self.store.read().await.domain(&name.to_ascii_lowercase()).await
    }

    pub async fn domains(&self) -> Vec<Domain> {
        self.store.read().await.domains().await
    }

    async fn require_domain(&self, name: &str) -> Result<Domain, Error> {
        self.store
            .read()
            .await
            .domain(name)
            .await
            .ok_or_else(|| Error::DomainNotFound(name.to_string()))
    }

    async fn save_domain(&self, domain: Domain) -> Result<Domain, Error> {
        self.store.write().await.put_domain(domain).await
    }

    /// Provision `domain`: create its zone, then its vhost, then (with `with_tls`) issue and
    /// install a certificate. The domain itself is recorded first, so a partially provisioned
    /// domain can be completed by provisioning it again.
    ///
    /// # Errors
    ///
    /// Returns an error only if the domain is invalid or can't be recorded. Failures of the
    /// individual steps are reported in the [`ProvisionReport`].
    pub async fn provision(
        &self,
        domain: Domain,
        with_tls: bool,
    ) -> Result<ProvisionReport, Error> {
        domain.validate()?;
        let _guard = self.locks.lock(&domain.name).await;
        let domain = match self.store.read().await.domain(&domain.name).await {
            // Keep what was recorded for a partially provisioned domain.
            Some(existing) => Domain {
                tls_enabled: existing.tls_enabled,
                subdomains: if domain.subdomains.is_empty() {
                    existing.subdomains
                } else {
                    domain.subdomains.clone()
                },
                created_at: existing.created_at,
                ..domain
            },
            None => domain,
        };
        let domain = self.save_domain(domain).await?;
        tracing::info!("provisioning {}", domain.name);

        let mut report = ProvisionReport {
            domain: domain.name.clone(),
            zone: StepOutcome::Skipped,
            virtual_host: StepOutcome::Skipped,
            certificate: StepOutcome::Skipped,
        };

        report.zone = self.step(&domain.name, self.provision_zone(&domain.name).await);
        if report.zone.is_failed() {
            return Ok(report);
        }
        report.virtual_host = self.step(&domain.name, self.provision_vhosts(&domain).await);
        if report.virtual_host.is_failed() || !with_tls {
            if report.is_complete() {
                self.notifier.notify(&Event::DomainProvisioned {
                    domain: domain.name.clone(),
                });
            }
            return Ok(report);
        }
        let certificate = self.issue_locked(domain.clone()).await.map(|_| ());
        report.certificate = self.step(&domain.name, certificate);
        if report.is_complete() {
            self.notifier.notify(&Event::DomainProvisioned {
                domain: domain.name.clone(),
            });
        }
        Ok(report)
    }

    fn step(&self, domain: &str, res: Result<(), Error>) -> StepOutcome {
        match res {
            Ok(()) => StepOutcome::Done,
            Err(err) => {
                let outcome = StepOutcome::failed(&err);
                self.notifier.notify(&Event::StepFailed {
                    domain: domain.to_string(),
                    stage: err.stage(),
                    reason: describe(&err),
                });
                outcome
            }
        }
    }

    /// Publish a fresh zone with the default records, or republish the recorded one under a
    /// new serial.
    async fn provision_zone(&self, name: &str) -> Result<(), Error> {
        let today = self.clock.today();
        let existing = {
            let store = self.store.read().await;
            match store.zone(name).await {
                Some(zone) => Some((zone, store.records(name).await)),
                None => None,
            }
        };
        let snapshot = match existing {
            Some((mut zone, records)) => {
                zone.serial = next_serial(zone.serial, today);
                ZoneSnapshot { zone, records }
            }
            None => ZoneSnapshot {
                zone: self.template.zone(name, initial_serial(today)),
                records: self.template.records(name),
            },
        };
        let published = self.dns.create_zone(&snapshot).await;
        let serial = snapshot.zone.serial;
        self.record_published(snapshot, published).await?;
        self.notifier.notify(&Event::ZoneCreated {
            zone: name.to_string(),
            serial,
        });
        Ok(())
    }

    async fn provision_vhosts(&self, domain: &Domain) -> Result<(), Error> {
        self.web.create_virtual_host(domain).await?;
        self.notifier.notify(&Event::VirtualHostCreated {
            hostname: domain.name.clone(),
        });
        for subdomain in &domain.subdomains {
            self.web
                .create_subdomain_virtual_host(domain, subdomain)
                .await?;
        }
        if domain.suspended {
            self.web.disable_virtual_host(domain).await?;
        }
        Ok(())
    }

    /// Remove everything published for domain `name`: its vhosts, its zone and its certificate
    /// material. Every step is attempted. The domain's records are forgotten only if every step
    /// succeeded, so a failed deprovisioning can simply be retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DomainNotFound`] for unknown domains.
    pub async fn deprovision(&self, name: &str) -> Result<DeprovisionReport, Error> {
        let name = name.to_ascii_lowercase();
        let _guard = self.locks.lock(&name).await;
        let domain = self.require_domain(&name).await?;
        tracing::info!("deprovisioning {name}");

        let virtual_host = RemovalOutcome::from_result(self.web.remove_virtual_host(&domain).await);
        if virtual_host == RemovalOutcome::Removed {
            self.notifier.notify(&Event::VirtualHostRemoved {
                hostname: name.clone(),
            });
        }
        let zone = RemovalOutcome::from_result(self.dns.remove_zone(&name).await);
        if zone == RemovalOutcome::Removed {
            self.notifier.notify(&Event::ZoneRemoved { zone: name.clone() });
        }
        let certificate =
            RemovalOutcome::from_result(self.certificates.remove_material(&name).await);
        if certificate == RemovalOutcome::Removed {
            self.notifier.notify(&Event::CertificateRevoked {
                domain: name.clone(),
            });
        }

        let report = DeprovisionReport {
            domain: name.clone(),
            virtual_host,
            zone,
            certificate,
        };
        if report.is_complete() {
            self.store.write().await.remove_domain(&name).await?;
            self.notifier
                .notify(&Event::DomainDeprovisioned { domain: name });
        } else {
            tracing::warn!("deprovisioning {name} incomplete, keeping its records");
        }
        Ok(report)
    }

    async fn load_zone(&self, name: &str) -> Result<(DnsZone, Vec<DnsRecord>), Error> {
        let store = self.store.read().await;
        let zone = store
            .zone(name)
            .await
            .ok_or_else(|| Error::ZoneNotFound(name.to_string()))?;
        Ok((zone, store.records(name).await))
    }

    /// Publish `records` as the new content of `zone` under the next serial, then record it.
    /// Returns the stored records.
    async fn commit_zone(
        &self,
        mut zone: DnsZone,
        records: Vec<DnsRecord>,
        change: ZoneChange<'_>,
    ) -> Result<Vec<DnsRecord>, Error> {
        validate_record_set(&zone.name, &records)?;
        zone.serial = next_serial(zone.serial, self.clock.today());
        let snapshot = ZoneSnapshot { zone, records };
        let published = match change {
            ZoneChange::Add(record) => self.dns.add_record(&snapshot, record).await,
            ZoneChange::Update(record) => self.dns.update_record(&snapshot, record).await,
            ZoneChange::Remove(record) => self.dns.remove_record(&snapshot, record).await,
            ZoneChange::Reset => self.dns.reset_zone(&snapshot).await,
            ZoneChange::Republish => self.dns.publish_zone(&snapshot).await,
        };
        let name = snapshot.zone.name.clone();
        let serial = snapshot.zone.serial;
        let stored = self.record_published(snapshot, published).await?;
        self.notifier
            .notify(&Event::ZoneUpdated { zone: name, serial });
        Ok(stored)
    }

    /// Record a snapshot the driver tried to publish. A failure at the reload stage means the
    /// new content is already in place under the new serial, so it is recorded anyway before
    /// the error is returned; the next change then moves past that serial.
    async fn record_published(
        &self,
        snapshot: ZoneSnapshot,
        published: Result<(), Error>,
    ) -> Result<Vec<DnsRecord>, Error> {
        let reload_failure = match published {
            Ok(()) => None,
            Err(err) if err.stage() == Some(Stage::Reload) => Some(err),
            Err(err) => return Err(err),
        };
        let name = snapshot.zone.name.clone();
        let serial = snapshot.zone.serial;
        let stored = self
            .store
            .write()
            .await
            .put_zone(snapshot.zone, snapshot.records)
            .await?;
        match reload_failure {
            None => Ok(stored),
            Some(err) => {
                tracing::warn!("zone {name} activated with serial {serial} but not reloaded");
                Err(err)
            }
        }
    }

    /// The recorded records of `zone`.
    pub async fn records(&self, zone: &str) -> Result<Vec<DnsRecord>, Error> {
        Ok(self.load_zone(&zone.to_ascii_lowercase()).await?.1)
    }

    pub async fn zone(&self, zone: &str) -> Result<DnsZone, Error> {
        Ok(self.load_zone(&zone.to_ascii_lowercase()).await?.0)
    }

    /// Add a record to `zone`, returning it as stored (normalized, with its id).
    pub async fn add_record(&self, zone: &str, record: DnsRecord) -> Result<DnsRecord, Error> {
        let zone = zone.to_ascii_lowercase();
        let _guard = self.locks.lock(&zone).await;
        self.add_record_locked(&zone, record).await
    }

    async fn add_record_locked(&self, zone: &str, record: DnsRecord) -> Result<DnsRecord, Error> {
        let (current, mut records) = self.load_zone(zone).await?;
        let mut record = validate_record(zone, &record)?;
        record.id = 0;
        records.push(record.clone());
        let stored = self
            .commit_zone(current, records, ZoneChange::Add(&record))
            .await?;
        // New records are appended, so the last stored record is this one.
        stored
            .last()
            .cloned()
            .ok_or_else(|| Error::ZoneNotFound(zone.to_string()))
    }

    /// Replace record `id` of `zone` with `record`.
    pub async fn update_record(
        &self,
        zone: &str,
        id: u64,
        record: DnsRecord,
    ) -> Result<DnsRecord, Error> {
        let zone = zone.to_ascii_lowercase();
        let _guard = self.locks.lock(&zone).await;
        let (current, mut records) = self.load_zone(&zone).await?;
        let index = records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::RecordNotFound {
                zone: zone.clone(),
                id,
            })?;
        let mut updated = validate_record(&zone, &record)?;
        updated.id = id;
        let previous = &records[index];
        let still_apex_ns = updated.is_apex() && updated.record_type == RecordType::NS;
        if !still_apex_ns {
            ensure_removable(&zone, &records, previous)?;
        }
        records[index] = updated.clone();
        self.commit_zone(current, records, ZoneChange::Update(&updated))
            .await?;
        Ok(updated)
    }

    /// Remove record `id` from `zone`.
    pub async fn remove_record(&self, zone: &str, id: u64) -> Result<(), Error> {
        let zone = zone.to_ascii_lowercase();
        let _guard = self.locks.lock(&zone).await;
        let (current, mut records) = self.load_zone(&zone).await?;
        let index = records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::RecordNotFound {
                zone: zone.clone(),
                id,
            })?;
        ensure_removable(&zone, &records, &records[index])?;
        let removed = records.remove(index);
        self.commit_zone(current, records, ZoneChange::Remove(&removed))
            .await?;
        Ok(())
    }

    /// Replace every record of `zone` with the default record set.
    pub async fn reset_zone(&self, zone: &str) -> Result<Vec<DnsRecord>, Error> {
        let zone = zone.to_ascii_lowercase();
        let _guard = self.locks.lock(&zone).await;
        let (current, _) = self.load_zone(&zone).await?;
        let records = self.template.records(&zone);
        self.commit_zone(current, records, ZoneChange::Reset).await
    }

    /// Add subdomain `name` to `domain`: an `A` record pointing at the server and a vhost
    /// serving `document_root` (by default `<domain document root>/<name>`).
    pub async fn create_subdomain(
        &self,
        domain: &str,
        name: &str,
        document_root: Option<PathBuf>,
    ) -> Result<Subdomain, Error> {
        let domain_name = domain.to_ascii_lowercase();
        let _guard = self.locks.lock(&domain_name).await;
        let mut domain = self.require_domain(&domain_name).await?;
        let name = name.trim().to_ascii_lowercase();
        let subdomain = Subdomain {
            document_root: document_root.unwrap_or_else(|| domain.document_root.join(&name)),
            name,
        };
        domain.subdomains.retain(|s| s.name != subdomain.name);
        domain.subdomains.push(subdomain.clone());
        domain.validate()?;

        if let Ok((_, records)) = self.load_zone(&domain.name).await {
            let exists = records.iter().any(|r| {
                r.name == subdomain.name
                    && matches!(r.record_type, RecordType::A | RecordType::CNAME)
            });
            if !exists {
                let record = DnsRecord::new(
                    subdomain.name.clone(),
                    RecordType::A,
                    self.template.server_ip.to_string(),
                    self.template.defaults.ttl,
                );
                self.add_record_locked(&domain.name, record).await?;
            }
        }

        self.web
            .create_subdomain_virtual_host(&domain, &subdomain)
            .await?;
        self.notifier.notify(&Event::VirtualHostCreated {
            hostname: subdomain.fqdn(&domain.name),
        });
        self.save_domain(domain).await?;
        Ok(subdomain)
    }

    /// Remove subdomain `name` from `domain`, with its vhost and the `A` record pointing at
    /// the server. Returns `false` if there was nothing to remove.
    pub async fn remove_subdomain(&self, domain: &str, name: &str) -> Result<bool, Error> {
        let domain_name = domain.to_ascii_lowercase();
        let _guard = self.locks.lock(&domain_name).await;
        let mut domain = self.require_domain(&domain_name).await?;
        let name = name.trim().to_ascii_lowercase();

        let vhost_removed = self
            .web
            .remove_subdomain_virtual_host(&domain, &name)
            .await?;
        if vhost_removed {
            self.notifier.notify(&Event::VirtualHostRemoved {
                hostname: format!("{name}.{}", domain.name),
            });
        }

        let mut records_removed = false;
        if let Ok((zone, records)) = self.load_zone(&domain.name).await {
            let server_ip = self.template.server_ip.to_string();
            let (removed, kept): (Vec<DnsRecord>, Vec<DnsRecord>) =
                records.into_iter().partition(|r| {
                    r.name == name && r.record_type == RecordType::A && r.content == server_ip
                });
            if !removed.is_empty() {
                self.commit_zone(zone, kept, ZoneChange::Republish).await?;
                records_removed = true;
            }
        }

        let known = domain.subdomains.iter().any(|s| s.name == name);
        if known {
            domain.subdomains.retain(|s| s.name != name);
            self.save_domain(domain).await?;
        }
        Ok(vhost_removed || records_removed || known)
    }

    /// Disable every vhost of `domain`. Its zone keeps being served.
    pub async fn suspend(&self, domain: &str) -> Result<(), Error> {
        let name = domain.to_ascii_lowercase();
        let _guard = self.locks.lock(&name).await;
        let mut domain = self.require_domain(&name).await?;
        self.web.disable_virtual_host(&domain).await?;
        domain.suspended = true;
        self.save_domain(domain).await?;
        self.notifier.notify(&Event::DomainSuspended { domain: name });
        Ok(())
    }

    pub async fn unsuspend(&self, domain: &str) -> Result<(), Error> {
        let name = domain.to_ascii_lowercase();
        let _guard = self.locks.lock(&name).await;
        let mut domain = self.require_domain(&name).await?;
        domain.suspended = false;
        self.web.enable_virtual_host(&domain).await?;
        self.save_domain(domain).await?;
        self.notifier
            .notify(&Event::DomainUnsuspended { domain: name });
        Ok(())
    }

    pub async fn certificate(&self, domain: &str) -> Option<SslCertificate> {
        self.store
            .read()
            .await
            .certificate(&domain.to_ascii_lowercase())
            .await
    }

    /// Issue a certificate for `domain` and install it. On failure the domain is left without
    /// a (new) certificate.
    pub async fn issue_certificate(&self, domain: &str) -> Result<SslCertificate, Error> {
        let name = domain.to_ascii_lowercase();
        let _guard = self.locks.lock(&name).await;
        let domain = self.require_domain(&name).await?;
        self.issue_locked(domain).await
    }

    async fn issue_locked(&self, domain: Domain) -> Result<SslCertificate, Error> {
        self.notifier.notify(&Event::CertificateRequested {
            domain: domain.name.clone(),
        });
        let certificate = self.certificates.issue(&domain).await?;
        self.notifier.notify(&Event::CertificateIssued {
            domain: domain.name.clone(),
            expires_at: certificate.expires_at(),
        });
        self.install_locked(domain, certificate).await
    }

    /// Install an uploaded certificate for `domain`. A key that doesn't match the certificate
    /// is rejected before anything is written.
    pub async fn upload_certificate(
        &self,
        domain: &str,
        material: CertificateMaterial,
    ) -> Result<SslCertificate, Error> {
        let name = domain.to_ascii_lowercase();
        let _guard = self.locks.lock(&name).await;
        let domain = self.require_domain(&name).await?;
        let certificate = self.certificates.accept_upload(&domain, &material)?;
        self.install_locked(domain, certificate).await
    }

    async fn install_locked(
        &self,
        mut domain: Domain,
        mut certificate: SslCertificate,
    ) -> Result<SslCertificate, Error> {
        self.certificates.install(&domain, &mut certificate).await?;
        self.store
            .write()
            .await
            .put_certificate(certificate.clone())
            .await?;
        domain.tls_enabled = true;
        let name = domain.name.clone();
        self.save_domain(domain).await?;
        self.notifier
            .notify(&Event::CertificateInstalled { domain: name });
        Ok(certificate)
    }

    /// Turn TLS off for `domain`: its TLS vhost and certificate material are removed and the
    /// certificate is marked revoked. Returns `false` if there was nothing to disable.
    pub async fn disable_certificate(&self, domain: &str) -> Result<bool, Error> {
        let name = domain.to_ascii_lowercase();
        let _guard = self.locks.lock(&name).await;
        let mut domain = self.require_domain(&name).await?;
        let removed = self.certificates.uninstall(&domain).await?;

        let revoked = match self.store.read().await.certificate(&name).await {
            Some(mut certificate) if certificate.state != CertState::Revoked => {
                certificate.advance(CertState::Revoked)?;
                Some(certificate)
            }
            _ => None,
        };
        let had_record = revoked.is_some();
        if let Some(certificate) = revoked {
            self.store.write().await.put_certificate(certificate).await?;
        }
        if domain.tls_enabled {
            domain.tls_enabled = false;
            self.save_domain(domain).await?;
        }
        if removed || had_record {
            self.notifier
                .notify(&Event::CertificateRevoked { domain: name });
        }
        Ok(removed || had_record)
    }

    /// Renew every certificate expiring within `lookahead_days` (by default the configured
    /// `renew_before_days`). Candidates are renewed concurrently and independently: one
    /// failing never stops the others. A dry run only reports the candidates.
    pub async fn renew_sweep(&self, lookahead_days: Option<u32>, dry_run: bool) -> SweepReport {
        let lookahead = lookahead_days.unwrap_or_else(|| self.certificates.renew_before_days());
        let now = self.clock.now();
        let certificates = self.store.read().await.certificates().await;
        let candidates: Vec<String> = select_for_renewal(&certificates, now, lookahead)
            .into_iter()
            .map(|c| c.domain.clone())
            .collect();
        tracing::info!(
            "renewal sweep: {} of {} certificates expire within {lookahead} days",
            candidates.len(),
            certificates.len()
        );

        let mut report = SweepReport {
            dry_run,
            candidates,
            ..SweepReport::default()
        };
        if dry_run {
            return report;
        }

        let results = join_all(
            report
                .candidates
                .iter()
                .map(|domain| self.renew_one(domain, lookahead)),
        )
        .await;
        for (domain, res) in report.candidates.iter().zip(results) {
            match res {
                Ok(true) => report.renewed.push(domain.clone()),
                Ok(false) => tracing::debug!("{domain} no longer due for renewal"),
                Err(err) => report.failed.push(SweepFailure {
                    domain: domain.clone(),
                    reason: describe(&err),
                }),
            }
        }
        tracing::info!(
            "renewal sweep done: {} renewed, {} failed",
            report.renewed.len(),
            report.failed.len()
        );
        report
    }

    /// Renew the certificate of one domain under its lock. Returns `false` if by the time the
    /// lock was acquired the certificate was no longer due.
    async fn renew_one(&self, name: &str, lookahead: u32) -> Result<bool, Error> {
        let _guard = self.locks.lock(name).await;
        let domain = self.require_domain(name).await?;
        let current = self
            .store
            .read()
            .await
            .certificate(name)
            .await
            .ok_or_else(|| Error::CertificateNotFound(name.to_string()))?;
        if !tls::due_for_renewal(&current, self.clock.now(), lookahead) {
            return Ok(false);
        }

        match self.certificates.renew(&domain, current).await {
            Ok(renewed) => {
                let expires_at = renewed.expires_at();
                self.store.write().await.put_certificate(renewed).await?;
                self.notifier.notify(&Event::CertificateRenewed {
                    domain: name.to_string(),
                    expires_at,
                });
                Ok(true)
            }
            Err(RenewalFailure { certificate, error }) => {
                self.store.write().await.put_certificate(certificate).await?;
                self.notifier.notify(&Event::CertificateRenewalFailed {
                    domain: name.to_string(),
                    reason: describe(&error),
                });
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_includes_causes() {
        let err = Error::IO(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            .at(Stage::Activate, "example.com");
        assert_eq!(
            describe(&err),
            "activate stage failed for example.com: an IO error occurred: disk full"
        );
    }

    #[test]
    fn reports_serialize_with_status_tags() {
        let report = ProvisionReport {
            domain: "example.com".into(),
            zone: StepOutcome::Done,
            virtual_host: StepOutcome::Failed {
                stage: Some(Stage::Validate),
                message: "nginx -t failed".into(),
            },
            certificate: StepOutcome::Skipped,
        };
        assert!(!report.is_complete());
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "domain": "example.com",
                "zone": {"status": "done"},
                "virtual_host": {
                    "status": "failed",
                    "stage": "validate",
                    "message": "nginx -t failed",
                },
                "certificate": {"status": "skipped"},
            })
        );
    }
}
