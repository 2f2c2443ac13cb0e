//! Control-plane records.
//!
//! These are the canonical records kept by the [state store][crate::state_store]. Everything a
//! driver writes to a daemon's configuration is derived from them.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use time::OffsetDateTime;
use trust_dns_proto::rr::Name;

/// The owning account of a domain. Supplied by the identity layer and treated as opaque input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    #[default]
    Primary,
    Addon,
    Alias,
    Parked,
}

impl FromStr for DomainKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(DomainKind::Primary),
            "addon" => Ok(DomainKind::Addon),
            "alias" => Ok(DomainKind::Alias),
            "parked" => Ok(DomainKind::Parked),
            other => Err(Error::Config(format!("unknown domain kind \"{other}\""))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subdomain {
    /// The leftmost label(s), e.g. `blog` for `blog.example.com`.
    pub name: String,
    pub document_root: PathBuf,
}

impl Subdomain {
    pub fn fqdn(&self, domain: &str) -> String {
        format!("{}.{domain}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub account: Account,
    pub document_root: PathBuf,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub kind: DomainKind,
    #[serde(default)]
    pub subdomains: Vec<Subdomain>,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl Domain {
    pub fn new(
        name: impl Into<String>,
        account: Account,
        document_root: impl Into<PathBuf>,
        kind: DomainKind,
    ) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            account,
            document_root: document_root.into(),
            tls_enabled: false,
            kind,
            subdomains: Vec::new(),
            suspended: false,
            created_at: None,
            updated_at: None,
        }
    }

    /// The hostnames the domain's vhost answers for, and that a certificate for it covers.
    /// Primary and addon domains also answer on `www.`.
    pub fn hostnames(&self) -> Vec<String> {
        match self.kind {
            DomainKind::Primary | DomainKind::Addon => {
                vec![self.name.clone(), format!("www.{}", self.name)]
            }
            DomainKind::Alias | DomainKind::Parked => vec![self.name.clone()],
        }
    }

    pub fn subdomain(&self, name: &str) -> Option<&Subdomain> {
        self.subdomains.iter().find(|s| s.name == name)
    }

    /// Check the name is a usable hostname and every document root is inside the account's
    /// home directory.
    pub fn validate(&self) -> Result<(), Error> {
        validate_hostname(&self.name)?;
        ensure_within(&self.document_root, &self.account.home)?;
        for sub in &self.subdomains {
            validate_hostname(&sub.fqdn(&self.name))?;
            ensure_within(&sub.document_root, &self.account.home)?;
        }
        Ok(())
    }
}

/// Accept registrable-looking hostnames: at least two labels, no wildcard, no trailing dot.
pub fn validate_hostname(name: &str) -> Result<(), Error> {
    let invalid = || Error::InvalidName(name.to_string());
    if name.is_empty() || name.ends_with('.') || name.contains('*') {
        return Err(invalid());
    }
    let parsed = Name::from_str(name).map_err(|_| invalid())?;
    if parsed.num_labels() < 2 {
        return Err(invalid());
    }
    let labels_ok = name.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    if labels_ok {
        Ok(())
    } else {
        Err(invalid())
    }
}

fn ensure_within(path: &Path, home: &Path) -> Result<(), Error> {
    let escapes = path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    if escapes || !path.starts_with(home) {
        return Err(Error::InvalidDocumentRoot {
            path: path.to_path_buf(),
            home: home.to_path_buf(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    AAAA,
    CNAME,
    MX,
    TXT,
    NS,
    SRV,
    CAA,
    PTR,
    /// Only ever materialized from the zone's own fields.
    SOA,
}

impl RecordType {
    /// Types that carry a priority field.
    pub fn has_priority(self) -> bool {
        matches!(self, RecordType::MX | RecordType::SRV)
    }

    /// Types whose content is a domain name.
    pub fn has_target(self) -> bool {
        matches!(
            self,
            RecordType::CNAME | RecordType::MX | RecordType::NS | RecordType::PTR
        )
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::CNAME => "CNAME",
            RecordType::MX => "MX",
            RecordType::TXT => "TXT",
            RecordType::NS => "NS",
            RecordType::SRV => "SRV",
            RecordType::CAA => "CAA",
            RecordType::PTR => "PTR",
            RecordType::SOA => "SOA",
        };
        f.write_str(name)
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            "MX" => Ok(RecordType::MX),
            "TXT" => Ok(RecordType::TXT),
            "NS" => Ok(RecordType::NS),
            "SRV" => Ok(RecordType::SRV),
            "CAA" => Ok(RecordType::CAA),
            "PTR" => Ok(RecordType::PTR),
            "SOA" => Ok(RecordType::SOA),
            other => Err(Error::InvalidRecord {
                name: String::new(),
                record_type: other.to_string(),
                reason: "unsupported record type".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Assigned by the state store; zero until the record has been stored.
    #[serde(default)]
    pub id: u64,
    /// Owner name relative to the zone, or `@` for the apex.
    pub name: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
}

impl DnsRecord {
    pub fn new(
        name: impl Into<String>,
        record_type: RecordType,
        content: impl Into<String>,
        ttl: u32,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            record_type,
            content: content.into(),
            ttl,
            priority: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn is_apex(&self) -> bool {
        self.name == "@"
    }

    /// Compare ignoring the store-assigned id.
    pub fn same_data(&self, other: &DnsRecord) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.record_type == other.record_type
            && self.content == other.content
            && self.ttl == other.ttl
            && self.priority == other.priority
    }
}

/// One zone per domain. The SOA record is materialized from these fields rather than stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsZone {
    /// The zone apex, which is also the owning domain's name.
    pub name: String,
    /// `YYYYMMDDnn`, see [`crate::dns::serial`].
    pub serial: u32,
    pub ttl: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
    pub primary_ns: String,
    pub secondary_ns: Vec<String>,
    /// The SOA RNAME in DNS form, e.g. `hostmaster.example.net`.
    pub hostmaster: String,
}

impl DnsZone {
    /// The SOA record content in master-file order: `mname rname serial refresh retry expire
    /// minimum`.
    pub fn soa_record(&self) -> DnsRecord {
        DnsRecord::new(
            "@",
            RecordType::SOA,
            format!(
                "{}. {}. {} {} {} {} {}",
                self.primary_ns.trim_end_matches('.'),
                self.hostmaster.trim_end_matches('.'),
                self.serial,
                self.refresh,
                self.retry,
                self.expire,
                self.minimum
            ),
            self.ttl,
        )
    }

    pub fn nameservers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_ns.as_str())
            .chain(self.secondary_ns.iter().map(String::as_str))
    }
}

/// A zone together with its full record set, as handed to a [`DnsDriver`][crate::dns::DnsDriver]
/// for publishing. The serial has already been allocated for this publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSnapshot {
    pub zone: DnsZone,
    pub records: Vec<DnsRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceKind {
    SelfSigned,
    Acme,
    Custom,
}

/// Certificate lifecycle states. A domain without a certificate record is in the implicit
/// `none` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertState {
    Requested,
    Issued,
    Installed,
    Expiring,
    Renewing,
    Renewed,
    Failed,
    Revoked,
}

impl CertState {
    pub fn can_advance(self, next: CertState) -> bool {
        use CertState::{Expiring, Failed, Installed, Issued, Renewed, Renewing, Requested, Revoked};
        matches!(
            (self, next),
            (Requested, Issued)
                | (Issued | Renewed, Installed | Revoked)
                | (Installed, Installed | Expiring | Revoked)
                | (Expiring, Renewing | Installed | Revoked)
                | (Renewing, Renewed | Failed)
                | (Failed, Expiring)
        )
    }
}

impl fmt::Display for CertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertState::Requested => "requested",
            CertState::Issued => "issued",
            CertState::Installed => "installed",
            CertState::Expiring => "expiring",
            CertState::Renewing => "renewing",
            CertState::Renewed => "renewed",
            CertState::Failed => "failed",
            CertState::Revoked => "revoked",
        };
        f.write_str(name)
    }
}

/// AES-256-GCM ciphertext of a PEM private key, see [`crate::tls::seal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    pub nonce: String,
    pub ciphertext: String,
}

/// A certificate belonging to exactly one domain.
///
/// Only constructed from certificate material (see
/// [`SslCertificate::from_material`][crate::tls]), so `issued_at` and `expires_at` are always
/// the certificate's own validity fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslCertificate {
    pub domain: String,
    pub kind: IssuanceKind,
    pub hostnames: Vec<String>,
    pub certificate_pem: String,
    pub(crate) sealed_key: SealedKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_pem: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub(crate) expires_at: OffsetDateTime,
    pub auto_renew: bool,
    pub state: CertState,
}

impl SslCertificate {
    pub fn issued_at(&self) -> OffsetDateTime {
        self.issued_at
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    pub fn sealed_key(&self) -> &SealedKey {
        &self.sealed_key
    }

    /// Move to `next`, or fail with [`Error::InvalidTransition`].
    pub fn advance(&mut self, next: CertState) -> Result<(), Error> {
        if !self.state.can_advance(next) {
            return Err(Error::InvalidTransition {
                domain: self.domain.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Where installed certificate material lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePaths {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub chain: Option<PathBuf>,
    pub full_chain: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            username: "alice".into(),
            uid: 1001,
            gid: 1001,
            home: "/home/alice".into(),
        }
    }

    #[test]
    fn primary_domains_answer_on_www() {
        let root = "/home/alice/public_html";
        let domain = Domain::new("Example.com", account(), root, DomainKind::Primary);
        assert_eq!(domain.hostnames(), vec!["example.com", "www.example.com"]);
        let parked = Domain::new("example.org", account(), root, DomainKind::Parked);
        assert_eq!(parked.hostnames(), vec!["example.org"]);
    }

    #[test]
    fn document_root_must_stay_in_home() {
        let mut domain = Domain::new("example.com", account(), "/var/www", DomainKind::Primary);
        assert!(matches!(domain.validate(), Err(Error::InvalidDocumentRoot { .. })));
        domain.document_root = "/home/alice/../bob/public_html".into();
        assert!(matches!(domain.validate(), Err(Error::InvalidDocumentRoot { .. })));
        domain.document_root = "/home/alice/public_html".into();
        assert!(domain.validate().is_ok());
    }

    #[test]
    fn hostnames_are_validated() {
        assert!(validate_hostname("example.com").is_ok());
        assert!(validate_hostname("a-b.example.co.uk").is_ok());
        for bad in ["localhost", "", "example.com.", "*.example.com", "-a.example.com", "a b.com"] {
            assert!(validate_hostname(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn renewal_failure_returns_to_expiring() {
        use CertState::*;
        assert!(Installed.can_advance(Expiring));
        assert!(Expiring.can_advance(Renewing));
        assert!(Renewing.can_advance(Failed));
        assert!(Failed.can_advance(Expiring));
        assert!(Renewing.can_advance(Renewed));
        assert!(Renewed.can_advance(Installed));
        assert!(!Failed.can_advance(Installed));
        assert!(!Revoked.can_advance(Installed));
        assert!(!Issued.can_advance(Renewing));
    }

    #[test]
    fn soa_is_materialized_from_zone_fields() {
        let zone = DnsZone {
            name: "example.com".into(),
            serial: 2026101801,
            ttl: 14_400,
            refresh: 86_400,
            retry: 7_200,
            expire: 3_600_000,
            minimum: 172_800,
            primary_ns: "ns1.example.net".into(),
            secondary_ns: vec!["ns2.example.net".into()],
            hostmaster: "hostmaster.example.net".into(),
        };
        let soa = zone.soa_record();
        assert_eq!(soa.record_type, RecordType::SOA);
        assert_eq!(
            soa.content,
            "ns1.example.net. hostmaster.example.net. 2026101801 86400 7200 3600000 172800"
        );
        assert_eq!(zone.nameservers().count(), 2);
    }
}
