//! Certificate acquisition.
//!
//! An [`AcmeTransport`] turns a list of hostnames into certificate material. How it proves
//! control of the names and talks to the CA is its own business; the lifecycle manager only
//! sees the resulting PEM material or an [`Error::Acme`].

use crate::clock::DynClock;
use crate::config::{AcmeConfig, Config};
use crate::error::Error;
use crate::model::IssuanceKind;
use crate::system::{CommandSpec, DynArtifacts, DynRunner};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub type DynAcmeTransport = Arc<dyn AcmeTransport + Send + Sync>;

/// PEM certificate material as issued or uploaded.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub chain_pem: Option<String>,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"<redacted>")
            .field("chain_pem", &self.chain_pem)
            .finish()
    }
}

/// What to ask the CA for.
#[derive(Debug, Clone, Copy)]
pub struct AcmeRequest<'a> {
    pub domain: &'a str,
    pub hostnames: &'a [String],
    /// Where HTTP-01 challenge responses are served from.
    pub webroot: &'a Path,
}

#[async_trait::async_trait]
pub trait AcmeTransport {
    fn kind(&self) -> IssuanceKind;

    async fn obtain(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error>;

    async fn renew(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error>;
}

/// Obtains certificates by running `certbot certonly --webroot` and reading the result from
/// certbot's `live` directory.
pub struct CertbotTransport {
    program: String,
    email: String,
    live_dir: PathBuf,
    staging: bool,
    /// certbot runs much longer than the other helpers, so it gets its own limit.
    timeout: Option<Duration>,
    runner: DynRunner,
    artifacts: DynArtifacts,
}

impl CertbotTransport {
    pub fn new(
        program: impl Into<String>,
        email: impl Into<String>,
        live_dir: impl Into<PathBuf>,
        staging: bool,
        runner: DynRunner,
        artifacts: DynArtifacts,
    ) -> Self {
        Self {
            program: program.into(),
            email: email.into(),
            live_dir: live_dir.into(),
            staging,
            timeout: None,
            runner,
            artifacts,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn spec(&self, request: &AcmeRequest<'_>, force: bool) -> CommandSpec {
        let mut args = vec![
            "certonly".to_string(),
            "--webroot".into(),
            "-w".into(),
            request.webroot.display().to_string(),
            "--non-interactive".into(),
            "--agree-tos".into(),
            "--email".into(),
            self.email.clone(),
            "--cert-name".into(),
            request.domain.to_string(),
        ];
        for hostname in request.hostnames {
            args.push("-d".into());
            args.push(hostname.clone());
        }
        if self.staging {
            args.push("--staging".into());
        }
        if force {
            args.push("--force-renewal".into());
        }
        CommandSpec {
            program: self.program.clone(),
            args,
            timeout: self.timeout,
        }
    }

    async fn read_live(&self, domain: &str, file: &str) -> Result<Option<String>, Error> {
        self.artifacts
            .read(&self.live_dir.join(domain).join(file))
            .await
    }

    async fn request(
        &self,
        request: &AcmeRequest<'_>,
        force: bool,
    ) -> Result<CertificateMaterial, Error> {
        let spec = self.spec(request, force);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(Error::Acme {
                domain: request.domain.to_string(),
                reason: output.combined(),
            });
        }
        let missing = |file: &str| Error::Acme {
            domain: request.domain.to_string(),
            reason: format!("certbot succeeded but {file} is missing"),
        };
        let certificate_pem = self
            .read_live(request.domain, "cert.pem")
            .await?
            .ok_or_else(|| missing("cert.pem"))?;
        let private_key_pem = self
            .read_live(request.domain, "privkey.pem")
            .await?
            .ok_or_else(|| missing("privkey.pem"))?;
        let chain_pem = self.read_live(request.domain, "chain.pem").await?;
        Ok(CertificateMaterial {
            certificate_pem,
            private_key_pem,
            chain_pem,
        })
    }
}

#[async_trait::async_trait]
impl AcmeTransport for CertbotTransport {
    fn kind(&self) -> IssuanceKind {
        IssuanceKind::Acme
    }

    async fn obtain(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error> {
        self.request(request, false).await
    }

    async fn renew(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error> {
        self.request(request, true).await
    }
}

/// Mints self-signed certificates locally. Useful for hosts that aren't publicly reachable and
/// for tests.
pub struct SelfSignedTransport {
    validity_days: u32,
    clock: DynClock,
}

impl SelfSignedTransport {
    pub fn new(validity_days: u32, clock: DynClock) -> Self {
        Self {
            validity_days,
            clock,
        }
    }

    fn mint(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error> {
        let failed = |e: rcgen::Error| Error::Acme {
            domain: request.domain.to_string(),
            reason: e.to_string(),
        };
        let mut params = CertificateParams::new(request.hostnames.to_vec()).map_err(failed)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, request.domain);
        params.distinguished_name = dn;
        // X.509 times have second precision.
        let now = self.clock.now();
        let now = now.replace_nanosecond(0).unwrap_or(now);
        params.not_before = now;
        params.not_after = now + time::Duration::days(i64::from(self.validity_days));

        let key = KeyPair::generate().map_err(failed)?;
        let cert = params.self_signed(&key).map_err(failed)?;
        Ok(CertificateMaterial {
            certificate_pem: cert.pem(),
            private_key_pem: key.serialize_pem(),
            chain_pem: None,
        })
    }
}

#[async_trait::async_trait]
impl AcmeTransport for SelfSignedTransport {
    fn kind(&self) -> IssuanceKind {
        IssuanceKind::SelfSigned
    }

    async fn obtain(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error> {
        self.mint(request)
    }

    async fn renew(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error> {
        self.mint(request)
    }
}

/// Build the configured transport.
pub fn from_config(
    config: &Config,
    runner: DynRunner,
    artifacts: DynArtifacts,
    clock: DynClock,
) -> DynAcmeTransport {
    match &config.tls.acme {
        AcmeConfig::Certbot {
            program,
            email,
            live_dir,
            staging,
        } => Arc::new(CertbotTransport::new(
            program.clone(),
            email.clone(),
            live_dir.clone(),
            *staging,
            runner,
            artifacts,
        )
        .with_timeout(config.tls.acme_timeout)),
        AcmeConfig::SelfSigned { validity_days } => {
            Arc::new(SelfSignedTransport::new(*validity_days, clock))
        }
    }
}
