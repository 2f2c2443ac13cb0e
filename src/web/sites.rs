//! The `sites-available`/`sites-enabled` driver shared by Apache and Nginx.

use super::{Site, VhostFormat, WebServerDriver};
use crate::config::{WebServerConfig, WebServerKind};
use crate::error::{Error, Stage, StageExt};
use crate::model::{CertificatePaths, Domain, Subdomain};
use crate::publish::{Changeset, Publisher};
use crate::system::CommandSpec;
use std::path::PathBuf;
use tokio::sync::Mutex;

pub struct SitesDriver<F> {
    format: F,
    config: WebServerConfig,
    publisher: Publisher,
    /// The config test checks the whole server configuration, so apply, test and reload run
    /// one change at a time. Guards whether activated changes still await a successful reload.
    reload_pending: Mutex<bool>,
}

impl<F: VhostFormat> SitesDriver<F> {
    pub fn new(format: F, config: WebServerConfig, publisher: Publisher) -> Self {
        Self {
            format,
            config,
            publisher,
            reload_pending: Mutex::new(false),
        }
    }

    fn file_name(name: &str, ssl: bool) -> String {
        if ssl {
            format!("{name}-ssl.conf")
        } else {
            format!("{name}.conf")
        }
    }

    pub fn available_path(&self, name: &str, ssl: bool) -> PathBuf {
        self.config.sites_available().join(Self::file_name(name, ssl))
    }

    pub fn enabled_path(&self, name: &str, ssl: bool) -> PathBuf {
        self.config.sites_enabled().join(Self::file_name(name, ssl))
    }

    fn write_enabled(
        &self,
        changes: Changeset,
        name: &str,
        ssl: bool,
        contents: String,
        enable: bool,
    ) -> Changeset {
        let available = self.available_path(name, ssl);
        let changes = changes.write(available.clone(), contents);
        if enable {
            changes.link(available, self.enabled_path(name, ssl))
        } else {
            changes.unlink(self.enabled_path(name, ssl))
        }
    }

    fn remove_site(&self, changes: Changeset, name: &str, ssl: bool) -> Changeset {
        changes
            .unlink(self.enabled_path(name, ssl))
            .remove(self.available_path(name, ssl))
    }

    async fn has_ssl(&self, name: &str) -> Result<bool, Error> {
        Ok(self
            .publisher
            .artifacts()
            .read(&self.available_path(name, true))
            .await?
            .is_some())
    }

    /// Every vhost file name belonging to `domain`: its own and each subdomain's.
    fn names(domain: &Domain) -> Vec<String> {
        std::iter::once(domain.name.clone())
            .chain(domain.subdomains.iter().map(|s| s.fqdn(&domain.name)))
            .collect()
    }

    fn check_spec(&self) -> CommandSpec {
        CommandSpec::from_argv(&self.config.test_command(), Vec::<String>::new())
    }

    /// Apply `changes`, run the config test and reload if anything changed, or if an earlier
    /// change was activated without a successful reload. Returns whether anything changed.
    async fn publish(&self, target: &str, changes: Changeset) -> Result<bool, Error> {
        let mut pending = self.reload_pending.lock().await;
        let changed = self
            .publisher
            .apply_checked(target, changes, &self.check_spec())
            .await?;
        if changed {
            self.reload_locked(&mut pending, target).await?;
        } else if *pending {
            tracing::info!("vhosts for {target} up to date, retrying the pending reload");
            self.reload_locked(&mut pending, target).await?;
        } else {
            tracing::debug!("vhosts for {target} already up to date");
        }
        Ok(changed)
    }

    /// Test and reload without changing any vhost, for when the files a vhost refers to were
    /// replaced.
    async fn recheck(&self, target: &str) -> Result<(), Error> {
        let mut pending = self.reload_pending.lock().await;
        let check = self.check_spec();
        let output = self
            .publisher
            .runner()
            .run(&check)
            .await
            .at_stage(Stage::Validate, target)?;
        if !output.success() {
            tracing::warn!("{target} rejected by `{check}`: {}", output.combined());
            return Err(Error::Invalid {
                target: target.to_string(),
                output: output.combined(),
            });
        }
        self.reload_locked(&mut pending, target).await
    }

    /// Reload, falling back to a restart. `pending` stays set until one of them succeeds.
    async fn reload_locked(&self, pending: &mut bool, target: &str) -> Result<(), Error> {
        let reload = CommandSpec::from_argv(&self.config.reload_command(), Vec::<String>::new());
        let restart = CommandSpec::from_argv(&self.config.restart_command(), Vec::<String>::new());
        *pending = true;
        self.publisher.reload(target, &reload, Some(&restart)).await?;
        *pending = false;
        Ok(())
    }

    async fn set_enabled(&self, domain: &Domain, enable: bool) -> Result<(), Error> {
        let artifacts = self.publisher.artifacts();
        let mut changes = Changeset::new();
        for name in Self::names(domain) {
            for ssl in [false, true] {
                let available = self.available_path(&name, ssl);
                if artifacts.read(&available).await?.is_none() {
                    continue;
                }
                changes = if enable {
                    changes.link(available, self.enabled_path(&name, ssl))
                } else {
                    changes.unlink(self.enabled_path(&name, ssl))
                };
            }
        }
        self.publish(&domain.name, changes).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<F> WebServerDriver for SitesDriver<F>
where
    F: VhostFormat + Send + Sync,
{
    fn kind(&self) -> WebServerKind {
        self.format.kind()
    }

    async fn create_virtual_host(&self, domain: &Domain) -> Result<(), Error> {
        domain.validate()?;
        let site = Site::for_domain(domain, &self.config.log_dir());
        let changes = self.write_enabled(
            Changeset::new(),
            &domain.name,
            false,
            self.format.render(&site),
            !domain.suspended,
        );
        self.publish(&domain.name, changes).await?;
        tracing::info!("created vhost for {}", domain.name);
        Ok(())
    }

    async fn update_virtual_host(&self, domain: &Domain) -> Result<(), Error> {
        domain.validate()?;
        let site = Site::for_domain(domain, &self.config.log_dir());
        let changes = Changeset::new().write(
            self.available_path(&domain.name, false),
            self.format.render(&site),
        );
        if self.publish(&domain.name, changes).await? {
            tracing::info!("updated vhost for {}", domain.name);
        }
        Ok(())
    }

    async fn remove_virtual_host(&self, domain: &Domain) -> Result<bool, Error> {
        let mut changes = Changeset::new();
        for name in Self::names(domain) {
            changes = self.remove_site(changes, &name, false);
            changes = self.remove_site(changes, &name, true);
        }
        let removed = self.publish(&domain.name, changes).await?;
        if removed {
            tracing::info!("removed vhosts for {}", domain.name);
        }
        Ok(removed)
    }

    async fn enable_virtual_host(&self, domain: &Domain) -> Result<(), Error> {
        self.set_enabled(domain, true).await?;
        tracing::info!("enabled vhosts for {}", domain.name);
        Ok(())
    }

    async fn disable_virtual_host(&self, domain: &Domain) -> Result<(), Error> {
        self.set_enabled(domain, false).await?;
        tracing::info!("disabled vhosts for {}", domain.name);
        Ok(())
    }

    async fn create_subdomain_virtual_host(
        &self,
        domain: &Domain,
        subdomain: &Subdomain,
    ) -> Result<(), Error> {
        let fqdn = subdomain.fqdn(&domain.name);
        let mut with_sub = domain.clone();
        with_sub.subdomains.retain(|s| s.name != subdomain.name);
        with_sub.subdomains.push(subdomain.clone());
        with_sub.validate()?;

        let site = Site::for_subdomain(domain, subdomain, &self.config.log_dir());
        let changes = self.write_enabled(
            Changeset::new(),
            &fqdn,
            false,
            self.format.render(&site),
            !domain.suspended,
        );
        self.publish(&fqdn, changes).await?;
        tracing::info!("created vhost for {fqdn}");
        Ok(())
    }

    async fn remove_subdomain_virtual_host(
        &self,
        domain: &Domain,
        subdomain: &str,
    ) -> Result<bool, Error> {
        let fqdn = format!("{subdomain}.{}", domain.name);
        let changes = self.remove_site(Changeset::new(), &fqdn, false);
        let removed = self.publish(&fqdn, changes).await?;
        if removed {
            tracing::info!("removed vhost for {fqdn}");
        }
        Ok(removed)
    }

    async fn enable_ssl(&self, domain: &Domain, paths: &CertificatePaths) -> Result<(), Error> {
        domain.validate()?;
        let site = Site::for_domain(domain, &self.config.log_dir());
        let changes = self.write_enabled(
            Changeset::new(),
            &domain.name,
            true,
            self.format.render_ssl(&site, paths),
            !domain.suspended,
        );
        if !self.publish(&domain.name, changes).await? {
            // Same vhost, new certificate material behind it.
            self.recheck(&domain.name).await?;
        }
        tracing::info!("enabled TLS for {}", domain.name);
        Ok(())
    }

    async fn disable_ssl(&self, domain: &Domain) -> Result<bool, Error> {
        let had_ssl = self.has_ssl(&domain.name).await?;
        let site = Site::for_domain(domain, &self.config.log_dir());
        let changes = self.write_enabled(
            Changeset::new(),
            &domain.name,
            false,
            self.format.render(&site),
            !domain.suspended,
        );
        let changes = self.remove_site(changes, &domain.name, true);
        self.publish(&domain.name, changes).await?;
        if had_ssl {
            tracing::info!("disabled TLS for {}", domain.name);
        }
        Ok(had_ssl)
    }

    async fn test_config(&self) -> Result<bool, Error> {
        let _guard = self.reload_pending.lock().await;
        self.publisher.check("web server", &self.check_spec()).await
    }

    async fn reload(&self) -> Result<(), Error> {
        let mut pending = self.reload_pending.lock().await;
        self.reload_locked(&mut pending, "web server").await
    }

    async fn version(&self) -> Result<String, Error> {
        let spec = CommandSpec::from_argv(&self.config.version_command(), Vec::<String>::new());
        let output = self
            .publisher
            .runner()
            .run(&spec)
            .await?
            .check(&spec)?;
        self.format
            .parse_version(&output.combined())
            .ok_or_else(|| Error::CommandFailed {
                command: spec.to_string(),
                status: output.status,
                output: format!("no version in output: {}", output.combined()),
            })
    }
}
