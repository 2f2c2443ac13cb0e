//! A JSON file-backed implementation of the [`StateStore`][super::StateStore] trait.
//!
//! Wraps a [`MemoryStateStore`][super::memory::MemoryStateStore] instance, persisting
//! updates to a JSON file on disk that can be reloaded across restarts.
use crate::error::Error;
use crate::model::{DnsRecord, DnsZone, Domain, SslCertificate};
use crate::state_store::memory::MemoryStateStore;
use crate::state_store::StateStore;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// A file-backed state store. After each update the JSON file on disk is replaced with the new
/// state (written to a sibling temporary file, then renamed over the original).
///
/// Wraps a [`MemoryStateStore`][super::memory::MemoryStateStore], operating the same way except
/// for maintaining state beyond in-memory.
#[derive(Default, Debug, Clone)]
pub struct FileStateStore {
    state: MemoryStateStore,
    path: PathBuf,
}

impl FileStateStore {
    /// Save the state as JSON to the store's configured path, or return an Error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJSON`] if a record in the store can't be serialized to JSON.
    ///
    /// Returns [`Error::IO`] if the serialized state can't be written to the backing file path.
    pub async fn save(&self) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(&self.state)?;
        write_replace(&self.path, &data).await
    }

    /// Load a [`FileStateStore`] from the JSON state located at the given path, creating an
    /// empty state file if there is none yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJSON`] if the JSON state file is invalid.
    ///
    /// Returns [`Error::IO`] if the path can't be opened or read.
    pub async fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let path = p.as_ref().to_path_buf();
        let state = match fs::read(&path).await {
            Ok(contents) => serde_json::from_slice(&contents)?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let state = MemoryStateStore::default();
                write_replace(&path, &serde_json::to_vec_pretty(&state)?).await?;
                state
            }
            Err(err) => return Err(Error::IO(err)),
        };
        Ok(Self { state, path })
    }
}

/// Write `data` next to `path` and rename it into place so readers never see a partial file.
pub(crate) async fn write_replace(path: &Path, data: &[u8]) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let mut output_file = File::create(&tmp).await?;
    output_file.write_all(data).await?;
    output_file.flush().await?;
    output_file.sync_all().await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl StateStore for FileStateStore {
    async fn domain(&self, name: &str) -> Option<Domain> {
        self.state.domain(name).await
    }

    async fn domains(&self) -> Vec<Domain> {
        self.state.domains().await
    }

    async fn put_domain(&mut self, domain: Domain) -> Result<Domain, Error> {
        let domain = self.state.put_domain(domain).await?;
        self.save().await?;
        Ok(domain)
    }

    async fn remove_domain(&mut self, name: &str) -> Result<bool, Error> {
        let removed = self.state.remove_domain(name).await?;
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn zone(&self, name: &str) -> Option<DnsZone> {
        self.state.zone(name).await
    }

    async fn records(&self, zone: &str) -> Vec<DnsRecord> {
        self.state.records(zone).await
    }

    async fn put_zone(
        &mut self,
        zone: DnsZone,
        records: Vec<DnsRecord>,
    ) -> Result<Vec<DnsRecord>, Error> {
        let records = self.state.put_zone(zone, records).await?;
        self.save().await?;
        Ok(records)
    }

    async fn remove_zone(&mut self, name: &str) -> Result<bool, Error> {
        let removed = self.state.remove_zone(name).await?;
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    async fn certificate(&self, domain: &str) -> Option<SslCertificate> {
        self.state.certificate(domain).await
    }

    async fn certificates(&self) -> Vec<SslCertificate> {
        self.state.certificates().await
    }

    async fn put_certificate(&mut self, certificate: SslCertificate) -> Result<(), Error> {
        self.state.put_certificate(certificate).await?;
        self.save().await
    }

    async fn remove_certificate(&mut self, domain: &str) -> Result<bool, Error> {
        let removed = self.state.remove_certificate(domain).await?;
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, DomainKind};

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/hostcrab.json");

        let mut store = FileStateStore::try_from_file(&path).await.unwrap();
        assert!(path.exists());
        let account = Account {
            username: "alice".into(),
            uid: 1001,
            gid: 1001,
            home: "/home/alice".into(),
        };
        store
            .put_domain(Domain::new(
                "example.com",
                account,
                "/home/alice/public_html",
                DomainKind::Primary,
            ))
            .await
            .unwrap();

        let reloaded = FileStateStore::try_from_file(&path).await.unwrap();
        let domain = reloaded.domain("example.com").await.unwrap();
        assert_eq!(domain.account.username, "alice");
    }

    #[tokio::test]
    async fn corrupt_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostcrab.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(matches!(
            FileStateStore::try_from_file(&path).await,
            Err(Error::InvalidJSON(_))
        ));
    }
}
