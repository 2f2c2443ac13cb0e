//! Web server virtual hosts.
//!
//! A [`WebServerDriver`] owns the per-domain vhost files of one web server. Both supported
//! servers use the Debian `sites-available`/`sites-enabled` layout, so a single generic
//! driver, [`sites::SitesDriver`], does the file handling and publishing, and a
//! [`VhostFormat`] ([`apache::Apache`] or [`nginx::Nginx`]) supplies the server's syntax.
//!
//! For `example.com` with config:
//! ```json
//! { "web_server": { "kind": "nginx" } }
//! ```
//!
//! the driver maintains:
//!
//! ```text
//! /etc/nginx/sites-available/example.com.conf
//! /etc/nginx/sites-available/example.com-ssl.conf      (once TLS is enabled)
//! /etc/nginx/sites-available/blog.example.com.conf     (per subdomain)
//! /etc/nginx/sites-enabled/example.com.conf -> ../sites-available/example.com.conf
//! ```
//!
//! Every change is checked with the server's own config test (`apache2ctl configtest`,
//! `nginx -t`) before the server is reloaded, and undone if the test fails.

pub mod apache;
pub mod nginx;
pub mod sites;

use crate::config::{Config, WebServerKind};
use crate::error::Error;
use crate::model::{Account, CertificatePaths, Domain, Subdomain};
use crate::publish::Publisher;
use crate::system::{DynArtifacts, DynRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub type DynWebServerDriver = Arc<dyn WebServerDriver + Send + Sync>;

/// Everything a vhost file is rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    /// The primary hostname, also used to name the vhost's files.
    pub server_name: String,
    pub aliases: Vec<String>,
    pub document_root: PathBuf,
    pub account: Account,
    pub access_log: PathBuf,
    pub error_log: PathBuf,
}

impl Site {
    pub fn for_domain(domain: &Domain, log_dir: &Path) -> Self {
        let mut hostnames = domain.hostnames().into_iter();
        let server_name = hostnames.next().unwrap_or_else(|| domain.name.clone());
        Self::new(
            server_name,
            hostnames.collect(),
            &domain.document_root,
            &domain.account,
            log_dir,
        )
    }

    pub fn for_subdomain(domain: &Domain, subdomain: &Subdomain, log_dir: &Path) -> Self {
        Self::new(
            subdomain.fqdn(&domain.name),
            Vec::new(),
            &subdomain.document_root,
            &domain.account,
            log_dir,
        )
    }

    fn new(
        server_name: String,
        aliases: Vec<String>,
        document_root: &Path,
        account: &Account,
        log_dir: &Path,
    ) -> Self {
        Self {
            access_log: log_dir.join(format!("{server_name}.access.log")),
            error_log: log_dir.join(format!("{server_name}.error.log")),
            server_name,
            aliases,
            document_root: document_root.to_path_buf(),
            account: account.clone(),
        }
    }

    /// `server_name` followed by the aliases.
    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.server_name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// The syntax of one web server's vhost files.
pub trait VhostFormat {
    fn kind(&self) -> WebServerKind;

    /// A plain HTTP vhost.
    fn render(&self, site: &Site) -> String;

    /// A TLS vhost serving the installed certificate at `paths`.
    fn render_ssl(&self, site: &Site, paths: &CertificatePaths) -> String;

    /// Extract the version number from the output of the server's version command.
    fn parse_version(&self, output: &str) -> Option<String>;
}

/// Pull `x.y.z` out of the first `<product>/x.y.z` in `output`.
pub(crate) fn version_after(output: &str, product: &str) -> Option<String> {
    let prefix = format!("{product}/");
    let start = output.find(&prefix)? + prefix.len();
    let version: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// The operations every web server backend supports.
///
/// Every mutating operation either leaves the server running the configuration of the last
/// successful call or fails; configuration that fails the server's own test is never left in
/// place. Removal of something already absent succeeds and returns `false`.
#[async_trait::async_trait]
pub trait WebServerDriver {
    fn kind(&self) -> WebServerKind;

    /// Write and enable the plain vhost for `domain`. Suspended domains are written but left
    /// disabled.
    async fn create_virtual_host(&self, domain: &Domain) -> Result<(), Error>;

    /// Rewrite the plain vhost for `domain`, e.g. after its document root changed.
    async fn update_virtual_host(&self, domain: &Domain) -> Result<(), Error>;

    /// Disable and delete every vhost of `domain`, its subdomains' included.
    async fn remove_virtual_host(&self, domain: &Domain) -> Result<bool, Error>;

    /// Re-enable the vhosts of a domain that was disabled.
    async fn enable_virtual_host(&self, domain: &Domain) -> Result<(), Error>;

    /// Disable every vhost of `domain` without deleting it.
    async fn disable_virtual_host(&self, domain: &Domain) -> Result<(), Error>;

    async fn create_subdomain_virtual_host(
        &self,
        domain: &Domain,
        subdomain: &Subdomain,
    ) -> Result<(), Error>;

    async fn remove_subdomain_virtual_host(
        &self,
        domain: &Domain,
        subdomain: &str,
    ) -> Result<bool, Error>;

    /// Write and enable the TLS vhost for `domain`, serving the certificate at `paths`. The
    /// server is tested and reloaded even if the vhost itself is unchanged, since the material
    /// at `paths` may be new.
    async fn enable_ssl(&self, domain: &Domain, paths: &CertificatePaths) -> Result<(), Error>;

    /// Remove the TLS vhost for `domain` and republish its plain vhost.
    async fn disable_ssl(&self, domain: &Domain) -> Result<bool, Error>;

    /// Run the server's config test against the live configuration.
    async fn test_config(&self) -> Result<bool, Error>;

    /// Reload the server, restarting it if the reload fails.
    async fn reload(&self) -> Result<(), Error>;

    async fn version(&self) -> Result<String, Error>;
}

/// Build the configured web server driver.
pub fn from_config(
    config: &Config,
    artifacts: DynArtifacts,
    runner: DynRunner,
) -> DynWebServerDriver {
    let publisher = Publisher::new(artifacts, runner);
    let web = config.web_server.clone();
    match web.kind {
        WebServerKind::Apache => Arc::new(sites::SitesDriver::new(apache::Apache, web, publisher)),
        WebServerKind::Nginx => Arc::new(sites::SitesDriver::new(nginx::Nginx, web, publisher)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DomainKind;
    use crate::test_utils::account;

    #[test]
    fn site_uses_domain_hostnames_and_logs() {
        let domain = Domain::new(
            "example.com",
            account(),
            "/home/alice/public_html",
            DomainKind::Addon,
        );
        let site = Site::for_domain(&domain, Path::new("/var/log/nginx"));
        assert_eq!(site.hostnames().collect::<Vec<_>>(), vec!["example.com", "www.example.com"]);
        assert_eq!(site.access_log, PathBuf::from("/var/log/nginx/example.com.access.log"));

        let sub = Subdomain {
            name: "blog".into(),
            document_root: "/home/alice/blog".into(),
        };
        let site = Site::for_subdomain(&domain, &sub, Path::new("/var/log/nginx"));
        assert_eq!(site.server_name, "blog.example.com");
        assert!(site.aliases.is_empty());
    }

    #[test]
    fn versions_are_extracted() {
        assert_eq!(
            version_after(
                "Server version: Apache/2.4.57 (Debian)\nServer built:",
                "Apache"
            )
            .as_deref(),
            Some("2.4.57")
        );
        assert_eq!(
            version_after("nginx version: nginx/1.24.0", "nginx").as_deref(),
            Some("1.24.0")
        );
        assert_eq!(version_after("command not found", "nginx"), None);
    }
}
