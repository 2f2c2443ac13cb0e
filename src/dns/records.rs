//! Record validation and the default record set of a new zone.

use crate::config::{Config, ZoneDefaults};
use crate::error::Error;
use crate::model::{DnsRecord, DnsZone, RecordType};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use trust_dns_proto::rr::Name;

/// Lowest TTL accepted for a record.
pub const MIN_TTL: u32 = 60;

const SPF: &str = "v=spf1 a mx ~all";

/// Everything needed to build a fresh zone for a domain.
#[derive(Debug, Clone)]
pub struct ZoneTemplate {
    pub nameservers: Vec<String>,
    pub hostmaster: String,
    pub server_ip: Ipv4Addr,
    pub server_ipv6: Option<Ipv6Addr>,
    pub defaults: ZoneDefaults,
}

impl ZoneTemplate {
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            nameservers: config
                .nameservers
                .iter()
                .map(|ns| ns.trim_end_matches('.').to_ascii_lowercase())
                .collect(),
            hostmaster: config.hostmaster()?,
            server_ip: config.server_ip,
            server_ipv6: config.server_ipv6,
            defaults: config.zone_defaults,
        })
    }

    pub fn zone(&self, domain: &str, serial: u32) -> DnsZone {
        let (primary, secondary) = self
            .nameservers
            .split_first()
            .map_or((String::new(), Vec::new()), |(p, s)| (p.clone(), s.to_vec()));
        DnsZone {
            name: domain.to_string(),
            serial,
            ttl: self.defaults.ttl,
            refresh: self.defaults.refresh,
            retry: self.defaults.retry,
            expire: self.defaults.expire,
            minimum: self.defaults.minimum,
            primary_ns: primary,
            secondary_ns: secondary,
            hostmaster: self.hostmaster.clone(),
        }
    }

    /// The records every new zone starts with.
    pub fn records(&self, domain: &str) -> Vec<DnsRecord> {
        let ttl = self.defaults.ttl;
        let mut records: Vec<DnsRecord> = self
            .nameservers
            .iter()
            .map(|ns| DnsRecord::new("@", RecordType::NS, ns.clone(), ttl))
            .collect();
        let v4 = self.server_ip.to_string();
        for owner in ["@", "www", "mail"] {
            records.push(DnsRecord::new(owner, RecordType::A, v4.clone(), ttl));
        }
        if let Some(v6) = self.server_ipv6 {
            for owner in ["@", "www"] {
                records.push(DnsRecord::new(owner, RecordType::AAAA, v6.to_string(), ttl));
            }
        }
        records.push(
            DnsRecord::new("@", RecordType::MX, format!("mail.{domain}"), ttl).with_priority(10),
        );
        records.push(DnsRecord::new("@", RecordType::TXT, SPF, ttl));
        records
    }
}

fn invalid(record: &DnsRecord, reason: impl Into<String>) -> Error {
    Error::InvalidRecord {
        name: record.name.clone(),
        record_type: record.record_type.to_string(),
        reason: reason.into(),
    }
}

fn label_ok(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Bring an owner name into the relative form records are stored in. `example.com.` and
/// `example.com` become `@` in zone `example.com`, `www.example.com` becomes `www`.
pub fn relative_owner(name: &str, zone: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    let absolute = name.ends_with('.');
    let bare = name.trim_end_matches('.');
    if bare.is_empty() || bare == "@" || bare == zone {
        return "@".into();
    }
    match bare.strip_suffix(zone).and_then(|s| s.strip_suffix('.')) {
        Some(relative) => relative.to_string(),
        None if absolute => name,
        None => bare.to_string(),
    }
}

/// Normalize a name-valued field: absolute names lose their trailing dot, everything is
/// lowercased. See [`render_target`][super::zonefile::render_target] for how it is written
/// back out.
fn normalize_target(record: &DnsRecord, target: &str) -> Result<String, Error> {
    let target = target.trim().trim_end_matches('.').to_ascii_lowercase();
    if target.is_empty() || Name::from_str(&target).is_err() || !target.split('.').all(label_ok) {
        return Err(invalid(record, format!("\"{target}\" is not a valid target name")));
    }
    Ok(target)
}

/// Validate a caller-supplied record against `zone`, returning it in normalized form.
pub fn validate_record(zone: &str, record: &DnsRecord) -> Result<DnsRecord, Error> {
    let mut normalized = record.clone();
    let owner = relative_owner(&record.name, zone);
    if owner.ends_with('.') {
        return Err(invalid(record, format!("owner is outside of zone {zone}")));
    }
    if owner != "@" {
        let mut labels = owner.split('.');
        let first = labels.next().unwrap_or_default();
        if !(first == "*" || label_ok(first)) || !labels.all(label_ok) {
            return Err(invalid(record, "invalid owner name"));
        }
        if Name::from_str(&format!("{owner}.{zone}")).is_err() {
            return Err(invalid(record, "invalid owner name"));
        }
    }
    normalized.name = owner;

    if record.ttl < MIN_TTL {
        return Err(invalid(record, format!("TTL must be at least {MIN_TTL}")));
    }
    if record.record_type.has_priority() {
        if record.priority.is_none() {
            return Err(invalid(record, "priority is required"));
        }
    } else {
        normalized.priority = None;
    }

    let content = record.content.trim();
    normalized.content = match record.record_type {
        RecordType::A => Ipv4Addr::from_str(content)
            .map_err(|_| invalid(record, "content is not an IPv4 address"))?
            .to_string(),
        RecordType::AAAA => Ipv6Addr::from_str(content)
            .map_err(|_| invalid(record, "content is not an IPv6 address"))?
            .to_string(),
        RecordType::CNAME | RecordType::MX | RecordType::NS | RecordType::PTR => {
            normalize_target(record, content)?
        }
        RecordType::TXT => {
            if content.is_empty() {
                return Err(invalid(record, "content is empty"));
            }
            record.content.clone()
        }
        RecordType::SRV => {
            let parts: Vec<&str> = content.split_whitespace().collect();
            match parts.as_slice() {
                [weight, port, target]
                    if weight.parse::<u16>().is_ok() && port.parse::<u16>().is_ok() =>
                {
                    format!("{weight} {port} {}", normalize_target(record, target)?)
                }
                _ => return Err(invalid(record, "content must be \"weight port target\"")),
            }
        }
        RecordType::CAA => {
            let mut parts = content.splitn(3, char::is_whitespace);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(flags), Some(tag), Some(value))
                    if flags.parse::<u8>().is_ok()
                        && matches!(tag, "issue" | "issuewild" | "iodef") =>
                {
                    let value = value.trim().trim_matches('"');
                    format!("{flags} {tag} \"{value}\"")
                }
                _ => return Err(invalid(record, "content must be \"flags tag value\"")),
            }
        }
        RecordType::SOA => return Err(invalid(record, "SOA records are derived from the zone")),
    };
    Ok(normalized)
}

/// Check the invariants that span the whole record set of a zone.
pub fn validate_record_set(zone: &str, records: &[DnsRecord]) -> Result<(), Error> {
    if !records
        .iter()
        .any(|r| r.is_apex() && r.record_type == RecordType::NS)
    {
        return Err(Error::ProtectedRecord(format!("{zone} NS")));
    }
    for cname in records.iter().filter(|r| r.record_type == RecordType::CNAME) {
        if cname.is_apex() {
            return Err(invalid(cname, "a CNAME can't be placed at the zone apex"));
        }
        let shared = records
            .iter()
            .filter(|r| r.name.eq_ignore_ascii_case(&cname.name))
            .count();
        if shared > 1 {
            return Err(invalid(cname, "a CNAME can't share its owner with other records"));
        }
    }
    Ok(())
}

/// Fail with [`Error::ProtectedRecord`] if `record` is the zone's last apex NS record.
pub fn ensure_removable(
    zone: &str,
    records: &[DnsRecord],
    record: &DnsRecord,
) -> Result<(), Error> {
    let apex_ns = |r: &DnsRecord| r.is_apex() && r.record_type == RecordType::NS;
    if apex_ns(record) && records.iter().filter(|r| apex_ns(r)).count() <= 1 {
        return Err(Error::ProtectedRecord(format!("{zone} NS {}", record.content)));
    }
    Ok(())
}
