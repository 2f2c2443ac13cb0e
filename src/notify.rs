//! Lifecycle events.
//!
//! The orchestrator reports what it did through a [`Notifier`]. The default [`TracingNotifier`]
//! only logs; hosts that need to fan events out elsewhere (a panel, a mail queue) plug in their
//! own implementation.

use crate::error::Stage;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;

pub type DynNotifier = Arc<dyn Notifier + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    DomainProvisioned { domain: String },
    DomainDeprovisioned { domain: String },
    DomainSuspended { domain: String },
    DomainUnsuspended { domain: String },
    ZoneCreated { zone: String, serial: u32 },
    ZoneUpdated { zone: String, serial: u32 },
    ZoneRemoved { zone: String },
    VirtualHostCreated { hostname: String },
    VirtualHostRemoved { hostname: String },
    CertificateRequested { domain: String },
    CertificateIssued {
        domain: String,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },
    CertificateInstalled { domain: String },
    CertificateRenewed {
        domain: String,
        #[serde(with = "time::serde::rfc3339")]
        expires_at: OffsetDateTime,
    },
    CertificateRenewalFailed { domain: String, reason: String },
    CertificateRevoked { domain: String },
    StepFailed {
        domain: String,
        stage: Option<Stage>,
        reason: String,
    },
}

impl Event {
    /// The domain or zone the event is about.
    pub fn subject(&self) -> &str {
        match self {
            Event::DomainProvisioned { domain }
            | Event::DomainDeprovisioned { domain }
            | Event::DomainSuspended { domain }
            | Event::DomainUnsuspended { domain }
            | Event::CertificateRequested { domain }
            | Event::CertificateIssued { domain, .. }
            | Event::CertificateInstalled { domain }
            | Event::CertificateRenewed { domain, .. }
            | Event::CertificateRenewalFailed { domain, .. }
            | Event::CertificateRevoked { domain }
            | Event::StepFailed { domain, .. } => domain,
            Event::ZoneCreated { zone, .. }
            | Event::ZoneUpdated { zone, .. }
            | Event::ZoneRemoved { zone } => zone,
            Event::VirtualHostCreated { hostname } | Event::VirtualHostRemoved { hostname } => {
                hostname
            }
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::DomainProvisioned { domain } => write!(f, "domain {domain} provisioned"),
            Event::DomainDeprovisioned { domain } => write!(f, "domain {domain} deprovisioned"),
            Event::DomainSuspended { domain } => write!(f, "domain {domain} suspended"),
            Event::DomainUnsuspended { domain } => write!(f, "domain {domain} unsuspended"),
            Event::ZoneCreated { zone, serial } => write!(f, "zone {zone} created ({serial})"),
            Event::ZoneUpdated { zone, serial } => write!(f, "zone {zone} updated ({serial})"),
            Event::ZoneRemoved { zone } => write!(f, "zone {zone} removed"),
            Event::VirtualHostCreated { hostname } => write!(f, "vhost {hostname} created"),
            Event::VirtualHostRemoved { hostname } => write!(f, "vhost {hostname} removed"),
            Event::CertificateRequested { domain } => {
                write!(f, "certificate for {domain} requested")
            }
            Event::CertificateIssued { domain, expires_at } => {
                write!(f, "certificate for {domain} issued, expires {expires_at}")
            }
            Event::CertificateInstalled { domain } => {
                write!(f, "certificate for {domain} installed")
            }
            Event::CertificateRenewed { domain, expires_at } => {
                write!(f, "certificate for {domain} renewed, expires {expires_at}")
            }
            Event::CertificateRenewalFailed { domain, reason } => {
                write!(f, "certificate renewal for {domain} failed: {reason}")
            }
            Event::CertificateRevoked { domain } => write!(f, "certificate for {domain} revoked"),
            Event::StepFailed {
                domain,
                stage: Some(stage),
                reason,
            } => write!(f, "{domain}: {stage} stage failed: {reason}"),
            Event::StepFailed {
                domain,
                stage: None,
                reason,
            } => write!(f, "{domain}: {reason}"),
        }
    }
}

pub trait Notifier {
    fn notify(&self, event: &Event);
}

/// Logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &Event) {
        match event {
            Event::CertificateRenewalFailed { .. } | Event::StepFailed { .. } => {
                tracing::error!("{event}");
            }
            _ => tracing::info!("{event}"),
        }
    }
}

/// Keeps every event in memory, in order.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<Event>>,
}

impl MemoryNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
