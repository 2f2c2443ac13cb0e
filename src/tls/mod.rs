//! TLS certificate lifecycle.
//!
//! The [`CertificateManager`] obtains certificates through an [`acme::AcmeTransport`], installs
//! them for the active [`WebServerDriver`][crate::web::WebServerDriver] and renews them before
//! they expire. Each certificate record moves through [`CertState`]:
//!
//! ```text
//! requested → issued → installed ⇄ expiring → renewing → renewed → installed
//!                                      ↑                ↘ failed ─┘
//! ```
//!
//! A failed renewal always lands back in `expiring`, so the next sweep picks it up again.
//!
//! Expiry is never stored independently of the certificate: an [`SslCertificate`] can only be
//! built from certificate material, and its `issued_at`/`expires_at` are read from the
//! certificate's own validity period.
//!
//! Installed material is laid out per domain under
//! [`TlsConfig::ssl_dir`][crate::config::TlsConfig::ssl_dir]:
//!
//! ```text
//! <ssl_dir>/example.com/cert.pem
//! <ssl_dir>/example.com/privkey.pem     (0600)
//! <ssl_dir>/example.com/chain.pem       (when the CA supplied one)
//! <ssl_dir>/example.com/fullchain.pem   (cert.pem followed by chain.pem)
//! ```

pub mod acme;
pub mod seal;
pub mod x509;

use crate::clock::DynClock;
use crate::error::{Error, Stage, StageExt};
use crate::model::{CertState, CertificatePaths, Domain, IssuanceKind, SslCertificate};
use crate::publish::{Changeset, Publisher};
use crate::web::DynWebServerDriver;
use acme::{AcmeRequest, CertificateMaterial, DynAcmeTransport};
use seal::KeySealer;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;

impl SslCertificate {
    /// Build a certificate record from PEM material, reading its validity and names from the
    /// certificate itself and sealing the private key. The record starts out `issued`.
    pub fn from_material(
        domain: &str,
        kind: IssuanceKind,
        material: &CertificateMaterial,
        sealer: &KeySealer,
        auto_renew: bool,
    ) -> Result<Self, Error> {
        let info = x509::parse_certificate(&material.certificate_pem)?;
        let hostnames = if info.dns_names.is_empty() {
            vec![domain.to_string()]
        } else {
            info.dns_names
        };
        Ok(Self {
            domain: domain.to_string(),
            kind,
            hostnames,
            certificate_pem: material.certificate_pem.clone(),
            sealed_key: sealer.seal(&material.private_key_pem)?,
            chain_pem: material.chain_pem.clone(),
            issued_at: info.not_before,
            expires_at: info.not_after,
            auto_renew,
            state: CertState::Issued,
        })
    }
}

/// Whether `certificate` is due for renewal at `now` with a lookahead of `threshold_days`.
pub fn due_for_renewal(
    certificate: &SslCertificate,
    now: OffsetDateTime,
    threshold_days: u32,
) -> bool {
    certificate.auto_renew
        && matches!(certificate.state, CertState::Installed | CertState::Expiring)
        && certificate.expires_at() - now <= time::Duration::days(i64::from(threshold_days))
}

/// The certificates a renewal sweep should attempt.
pub fn select_for_renewal(
    certificates: &[SslCertificate],
    now: OffsetDateTime,
    threshold_days: u32,
) -> Vec<&SslCertificate> {
    certificates
        .iter()
        .filter(|c| due_for_renewal(c, now, threshold_days))
        .collect()
}

/// A renewal that didn't go through. `certificate` is the record to keep: the previous
/// certificate, back in the `expiring` state.
#[derive(Debug)]
pub struct RenewalFailure {
    pub certificate: SslCertificate,
    pub error: Error,
}

pub struct CertificateManager {
    ssl_dir: PathBuf,
    renew_before_days: u32,
    acme_timeout: Duration,
    transport: DynAcmeTransport,
    sealer: KeySealer,
    publisher: Publisher,
    web: DynWebServerDriver,
    clock: DynClock,
}

impl CertificateManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ssl_dir: impl Into<PathBuf>,
        renew_before_days: u32,
        acme_timeout: Duration,
        transport: DynAcmeTransport,
        sealer: KeySealer,
        publisher: Publisher,
        web: DynWebServerDriver,
        clock: DynClock,
    ) -> Self {
        Self {
            ssl_dir: ssl_dir.into(),
            renew_before_days,
            acme_timeout,
            transport,
            sealer,
            publisher,
            web,
            clock,
        }
    }

    pub fn renew_before_days(&self) -> u32 {
        self.renew_before_days
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn paths(&self, domain: &str, with_chain: bool) -> CertificatePaths {
        let dir = self.ssl_dir.join(domain);
        CertificatePaths {
            certificate: dir.join("cert.pem"),
            private_key: dir.join("privkey.pem"),
            chain: with_chain.then(|| dir.join("chain.pem")),
            full_chain: with_chain.then(|| dir.join("fullchain.pem")),
        }
    }

    async fn bounded<T, F>(&self, domain: &str, call: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        tokio::time::timeout(self.acme_timeout, call)
            .await
            .map_err(|_| Error::Acme {
                domain: domain.to_string(),
                reason: format!("timed out after {:?}", self.acme_timeout),
            })?
    }

    /// Obtain a new certificate for `domain` and its `www.` alias where it has one, proving
    /// control through the domain's document root. Nothing is written on failure.
    pub async fn issue(&self, domain: &Domain) -> Result<SslCertificate, Error> {
        let hostnames = domain.hostnames();
        let request = AcmeRequest {
            domain: &domain.name,
            hostnames: &hostnames,
            webroot: &domain.document_root,
        };
        tracing::info!("requesting certificate for {}", hostnames.join(", "));
        let material = self
            .bounded(&domain.name, self.transport.obtain(&request))
            .await?;
        let certificate = SslCertificate::from_material(
            &domain.name,
            self.transport.kind(),
            &material,
            &self.sealer,
            true,
        )?;
        tracing::info!(
            "certificate for {} issued, expires {}",
            domain.name,
            certificate.expires_at()
        );
        Ok(certificate)
    }

    /// Check uploaded material and turn it into a custom certificate record. Mismatched pairs
    /// are rejected before anything else happens.
    pub fn accept_upload(
        &self,
        domain: &Domain,
        material: &CertificateMaterial,
    ) -> Result<SslCertificate, Error> {
        if !x509::verify_pair(&material.certificate_pem, &material.private_key_pem) {
            tracing::warn!("rejected certificate upload for {}: key mismatch", domain.name);
            return Err(Error::CertificateMismatch);
        }
        SslCertificate::from_material(
            &domain.name,
            IssuanceKind::Custom,
            material,
            &self.sealer,
            false,
        )
    }

    /// Write the certificate material and enable TLS on the web server. The previous material
    /// is restored if the web server rejects the new configuration. On success the record is
    /// `installed`.
    pub async fn install(
        &self,
        domain: &Domain,
        certificate: &mut SslCertificate,
    ) -> Result<(), Error> {
        if !certificate.state.can_advance(CertState::Installed) {
            return Err(Error::InvalidTransition {
                domain: certificate.domain.clone(),
                from: certificate.state.to_string(),
                to: CertState::Installed.to_string(),
            });
        }
        let private_key = self
            .sealer
            .unseal(certificate.sealed_key())
            .at_stage(Stage::Render, &domain.name)?;
        if !x509::verify_pair(&certificate.certificate_pem, &private_key) {
            return Err(Error::CertificateMismatch);
        }

        let paths = self.paths(&domain.name, certificate.chain_pem.is_some());
        let mut changes = Changeset::new()
            .write(&paths.certificate, certificate.certificate_pem.clone())
            .write_private(&paths.private_key, private_key);
        // A previous certificate may have come with a chain this one doesn't have.
        let all = self.paths(&domain.name, true);
        if let (Some(chain_path), Some(full_chain_path)) = (all.chain, all.full_chain) {
            changes = match &certificate.chain_pem {
                Some(chain) => {
                    let mut full_chain = certificate.certificate_pem.trim_end().to_string();
                    full_chain.push('\n');
                    full_chain.push_str(chain);
                    changes
                        .write(chain_path, chain.clone())
                        .write(full_chain_path, full_chain)
                }
                None => changes.remove(chain_path).remove(full_chain_path),
            };
        }

        let applied = self.publisher.apply(&domain.name, changes).await?;
        if let Err(err) = self.web.enable_ssl(domain, &paths).await {
            tracing::warn!("enabling TLS for {} failed, restoring previous material", domain.name);
            applied.rollback().await?;
            return Err(err);
        }
        certificate.advance(CertState::Installed)?;
        tracing::info!("installed certificate for {}", domain.name);
        Ok(())
    }

    /// Disable TLS on the web server and delete the installed material. Returns `false` if
    /// there was nothing to remove.
    pub async fn uninstall(&self, domain: &Domain) -> Result<bool, Error> {
        let disabled = self.web.disable_ssl(domain).await?;
        let removed = self.remove_material(&domain.name).await?;
        Ok(disabled || removed)
    }

    /// Delete the installed material of `domain` without touching the web server. Returns
    /// `false` if there was none.
    pub async fn remove_material(&self, domain: &str) -> Result<bool, Error> {
        let paths = self.paths(domain, true);
        let mut changes = Changeset::new()
            .remove(&paths.certificate)
            .remove(&paths.private_key);
        for path in paths.chain.iter().chain(paths.full_chain.iter()) {
            changes = changes.remove(path);
        }
        let removed = self.publisher.apply(domain, changes).await?.changed();
        if let Some(dir) = paths.certificate.parent() {
            self.publisher
                .artifacts()
                .remove_dir(dir)
                .await
                .at_stage(Stage::Activate, domain)?;
        }
        if removed {
            tracing::info!("removed certificate material for {domain}");
        }
        Ok(removed)
    }

    /// Renew `current` and install the result. On failure the returned record is `current`,
    /// moved back to `expiring`.
    pub async fn renew(
        &self,
        domain: &Domain,
        mut current: SslCertificate,
    ) -> Result<SslCertificate, RenewalFailure> {
        if current.state == CertState::Installed {
            if let Err(error) = current.advance(CertState::Expiring) {
                return Err(RenewalFailure { certificate: current, error });
            }
        }
        if let Err(error) = current.advance(CertState::Renewing) {
            return Err(RenewalFailure { certificate: current, error });
        }

        match self.renew_and_install(domain).await {
            Ok(renewed) => Ok(renewed),
            Err(error) => {
                tracing::error!("renewal for {} failed: {error}", domain.name);
                // A failed renewal leaves the old certificate in service, due again next sweep.
                current.state = CertState::Expiring;
                Err(RenewalFailure { certificate: current, error })
            }
        }
    }

    async fn renew_and_install(&self, domain: &Domain) -> Result<SslCertificate, Error> {
        let hostnames = domain.hostnames();
        let request = AcmeRequest {
            domain: &domain.name,
            hostnames: &hostnames,
            webroot: &domain.document_root,
        };
        let material = self
            .bounded(&domain.name, self.transport.renew(&request))
            .await?;
        let mut renewed = SslCertificate::from_material(
            &domain.name,
            self.transport.kind(),
            &material,
            &self.sealer,
            true,
        )?;
        renewed.state = CertState::Renewed;
        self.install(domain, &mut renewed).await?;
        tracing::info!(
            "renewed certificate for {}, now expires {}",
            domain.name,
            renewed.expires_at()
        );
        Ok(renewed)
    }
}
