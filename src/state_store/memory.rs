use crate::error::Error;
use crate::model::{DnsRecord, DnsZone, Domain, SslCertificate};
use crate::state_store::StateStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStateStore {
    #[serde(default)]
    domains: BTreeMap<String, Domain>,
    #[serde(default)]
    zones: BTreeMap<String, DnsZone>,
    #[serde(default)]
    records: BTreeMap<String, Vec<DnsRecord>>,
    #[serde(default)]
    certificates: BTreeMap<String, SslCertificate>,
    #[serde(default)]
    next_record_id: u64,
}

impl MemoryStateStore {
    fn assign_ids(&mut self, records: &mut [DnsRecord]) {
        for record in records.iter_mut().filter(|r| r.id == 0) {
            self.next_record_id += 1;
            record.id = self.next_record_id;
        }
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn domain(&self, name: &str) -> Option<Domain> {
        self.domains.get(name).cloned()
    }

    async fn domains(&self) -> Vec<Domain> {
        self.domains.values().cloned().collect()
    }

    async fn put_domain(&mut self, mut domain: Domain) -> Result<Domain, Error> {
        let now = OffsetDateTime::now_utc();
        domain.created_at = self
            .domains
            .get(&domain.name)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        domain.updated_at = Some(now);
        self.domains.insert(domain.name.clone(), domain.clone());
        Ok(domain)
    }

    async fn remove_domain(&mut self, name: &str) -> Result<bool, Error> {
        let zone = self.zones.remove(name).is_some();
        self.records.remove(name);
        let certificate = self.certificates.remove(name).is_some();
        let domain = self.domains.remove(name).is_some();
        Ok(domain || zone || certificate)
    }

    async fn zone(&self, name: &str) -> Option<DnsZone> {
        self.zones.get(name).cloned()
    }

    async fn records(&self, zone: &str) -> Vec<DnsRecord> {
        self.records.get(zone).cloned().unwrap_or_default()
    }

    async fn put_zone(
        &mut self,
        zone: DnsZone,
        mut records: Vec<DnsRecord>,
    ) -> Result<Vec<DnsRecord>, Error> {
        self.assign_ids(&mut records);
        self.records.insert(zone.name.clone(), records.clone());
        self.zones.insert(zone.name.clone(), zone);
        Ok(records)
    }

    async fn remove_zone(&mut self, name: &str) -> Result<bool, Error> {
        self.records.remove(name);
        Ok(self.zones.remove(name).is_some())
    }

    async fn certificate(&self, domain: &str) -> Option<SslCertificate> {
        self.certificates.get(domain).cloned()
    }

    async fn certificates(&self) -> Vec<SslCertificate> {
        self.certificates.values().cloned().collect()
    }

    async fn put_certificate(&mut self, certificate: SslCertificate) -> Result<(), Error> {
        self.certificates
            .insert(certificate.domain.clone(), certificate);
        Ok(())
    }

    async fn remove_certificate(&mut self, domain: &str) -> Result<bool, Error> {
        Ok(self.certificates.remove(domain).is_some())
    }
}
