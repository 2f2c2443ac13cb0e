//! Shared harness for the integration tests: an orchestrator wired to in-memory artifacts, a
//! scripted command runner, a fixed clock and a self-signed ACME transport that can be told to
//! fail for given domains.

#![allow(dead_code)]

use hostcrab::clock::FixedClock;
use hostcrab::config::{BindConfig, Config, PowerDnsConfig};
use hostcrab::dns::bind::BindDriver;
use hostcrab::dns::powerdns::PowerDnsDriver;
use hostcrab::dns::table::MemoryRecordTable;
use hostcrab::dns::{DynDnsDriver, ZoneTemplate};
use hostcrab::error::Error;
use hostcrab::model::{Account, DnsRecord, Domain, DomainKind, IssuanceKind, RecordType};
use hostcrab::notify::MemoryNotifier;
use hostcrab::publish::Publisher;
use hostcrab::state_store::MemoryStateStore;
use hostcrab::system::{CommandOutput, CommandRunner, CommandSpec, MemoryArtifacts};
use hostcrab::tls::acme::{AcmeRequest, AcmeTransport, CertificateMaterial, SelfSignedTransport};
use hostcrab::tls::seal::KeySealer;
use hostcrab::tls::CertificateManager;
use hostcrab::web::DynWebServerDriver;
use hostcrab::Orchestrator;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio::sync::RwLock;

pub const SEAL_KEY: &str = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";
pub const SERVER_IP: &str = "203.0.113.10";
pub const SSL_DIR: &str = "/etc/hostcrab/ssl";
pub const NOW: OffsetDateTime = datetime!(2026-10-18 12:00 UTC);

/// Checkers reject any artifact containing this marker.
pub const BROKEN: &str = "broken";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dns {
    Bind,
    PowerDns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Web {
    Apache,
    Nginx,
}

pub fn config(web: Web) -> Config {
    let web = match web {
        Web::Apache => "apache",
        Web::Nginx => "nginx",
    };
    serde_json::from_value(serde_json::json!({
        "server_ip": SERVER_IP,
        "nameservers": ["ns1.example.net", "ns2.example.net"],
        "hostmaster": "hostmaster@example.net",
        "web_server": { "kind": web },
        "dns": { "kind": "bind" },
        "tls": {
            "ssl_dir": SSL_DIR,
            "seal_key": SEAL_KEY,
            "acme": { "kind": "self_signed", "validity_days": 90 }
        }
    }))
    .unwrap()
}

/// Answers commands the way the real daemons would, looking at what was written to
/// [`MemoryArtifacts`]:
///
/// * `named-checkzone <zone> <path>` fails if the file contains [`BROKEN`].
/// * `nginx -t` and `apache2ctl configtest` fail if any vhost contains [`BROKEN`].
/// * `nginx -v` and `apache2 -v` print a version banner.
/// * Command lines starting with a prefix passed to [`ScriptedRunner::fail`] exit 1.
///
/// Everything else succeeds.
pub struct ScriptedRunner {
    artifacts: Arc<MemoryArtifacts>,
    failing: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(artifacts: Arc<MemoryArtifacts>) -> Self {
        Self {
            artifacts,
            failing: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    pub fn fail(&self, prefix: &str) {
        self.failing.lock().unwrap().push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.lines().iter().filter(|l| l.starts_with(prefix)).count()
    }

    fn vhosts_broken(&self) -> bool {
        self.artifacts.files().iter().any(|path| {
            path.to_string_lossy().contains("sites-available")
                && self
                    .artifacts
                    .contents(path)
                    .is_some_and(|c| c.contains(BROKEN))
        })
    }

    fn answer(&self, spec: &CommandSpec, line: &str) -> CommandOutput {
        let failing = self.failing.lock().unwrap().clone();
        if failing.iter().any(|prefix| line.starts_with(prefix.as_str())) {
            return CommandOutput::failed(1, format!("scripted failure of `{line}`"));
        }
        match (spec.program.as_str(), spec.args.first().map(String::as_str)) {
            ("named-checkzone", _) => {
                let zone = spec.args.first().cloned().unwrap_or_default();
                let broken = spec
                    .args
                    .get(1)
                    .and_then(|path| self.artifacts.contents(Path::new(path)))
                    .is_some_and(|c| c.contains(BROKEN));
                if broken {
                    CommandOutput::failed(1, format!("zone {zone}/IN: bad record"))
                } else {
                    CommandOutput::ok(format!("zone {zone}/IN: loaded serial 1\nOK"))
                }
            }
            ("nginx", Some("-t")) | ("apache2ctl", Some("configtest")) => {
                if self.vhosts_broken() {
                    CommandOutput::failed(1, "syntax error")
                } else {
                    CommandOutput::ok("syntax is ok")
                }
            }
            ("nginx", Some("-v")) => CommandOutput {
                status: Some(0),
                stdout: String::new(),
                stderr: "nginx version: nginx/1.24.0".into(),
            },
            ("apache2", Some("-v")) => CommandOutput::ok(
                "Server version: Apache/2.4.58 (Ubuntu)\nServer built:   2024-10-02T12:40:51",
            ),
            _ => CommandOutput::ok(""),
        }
    }
}

#[async_trait::async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, Error> {
        let line = spec.to_string();
        self.calls.lock().unwrap().push(line.clone());
        Ok(self.answer(spec, &line))
    }
}

/// Mints self-signed certificates, except for domains passed to [`ScriptedAcme::fail`], which
/// get the error a CA would give for a failed challenge.
pub struct ScriptedAcme {
    inner: SelfSignedTransport,
    failing: Mutex<Vec<String>>,
}

impl ScriptedAcme {
    pub fn new(clock: Arc<FixedClock>) -> Self {
        Self {
            inner: SelfSignedTransport::new(90, clock),
            failing: Mutex::default(),
        }
    }

    pub fn fail(&self, domain: &str) {
        self.failing.lock().unwrap().push(domain.to_string());
    }

    fn check(&self, request: &AcmeRequest<'_>) -> Result<(), Error> {
        if self.failing.lock().unwrap().iter().any(|d| d == request.domain) {
            return Err(Error::Acme {
                domain: request.domain.to_string(),
                reason: "challenge failed".into(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AcmeTransport for ScriptedAcme {
    fn kind(&self) -> IssuanceKind {
        IssuanceKind::SelfSigned
    }

    async fn obtain(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error> {
        self.check(request)?;
        self.inner.obtain(request).await
    }

    async fn renew(&self, request: &AcmeRequest<'_>) -> Result<CertificateMaterial, Error> {
        self.check(request)?;
        self.inner.renew(request).await
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub runner: Arc<ScriptedRunner>,
    pub acme: Arc<ScriptedAcme>,
    pub clock: Arc<FixedClock>,
    pub notifier: Arc<MemoryNotifier>,
    pub dns: DynDnsDriver,
    pub web: DynWebServerDriver,
}

impl Harness {
    pub fn new(dns: Dns, web: Web) -> Self {
        let config = config(web);
        let artifacts = Arc::new(MemoryArtifacts::default());
        let runner = Arc::new(ScriptedRunner::new(artifacts.clone()));
        let clock = Arc::new(FixedClock::new(NOW));
        let notifier = Arc::new(MemoryNotifier::default());
        let acme = Arc::new(ScriptedAcme::new(clock.clone()));
        let publisher = || Publisher::new(artifacts.clone(), runner.clone());

        let dns: DynDnsDriver = match dns {
            Dns::Bind => Arc::new(BindDriver::new(BindConfig::default(), publisher())),
            Dns::PowerDns => Arc::new(PowerDnsDriver::new(
                PowerDnsConfig::default(),
                publisher(),
                Arc::new(RwLock::new(MemoryRecordTable::default())),
            )),
        };
        let web = hostcrab::web::from_config(&config, artifacts.clone(), runner.clone());
        let certificates = CertificateManager::new(
            SSL_DIR,
            config.tls.renew_before_days,
            Duration::from_secs(300),
            acme.clone(),
            KeySealer::new(&config.tls.seal_key_bytes().unwrap()).unwrap(),
            publisher(),
            web.clone(),
            clock.clone(),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(RwLock::new(MemoryStateStore::default())),
            dns.clone(),
            web.clone(),
            certificates,
            ZoneTemplate::from_config(&config).unwrap(),
            clock.clone(),
            notifier.clone(),
        );
        Self {
            orchestrator: Arc::new(orchestrator),
            artifacts,
            runner,
            acme,
            clock,
            notifier,
            dns,
            web,
        }
    }

    pub fn bind() -> Self {
        Self::new(Dns::Bind, Web::Nginx)
    }

    pub fn advance_days(&self, days: i64) {
        self.clock.advance(time::Duration::days(days));
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.artifacts.contents(Path::new(path))
    }
}

pub fn account() -> Account {
    Account {
        username: "alice".into(),
        uid: 1001,
        gid: 1001,
        home: "/home/alice".into(),
    }
}

pub fn domain(name: &str) -> Domain {
    Domain::new(
        name,
        account(),
        format!("/home/alice/{name}/public_html"),
        DomainKind::Primary,
    )
}

/// Whether `records` holds a `record_type` record at `name` with `content`, ignoring a trailing
/// dot on name-valued content.
pub fn has(records: &[DnsRecord], name: &str, record_type: RecordType, content: &str) -> bool {
    records.iter().any(|r| {
        r.name == name
            && r.record_type == record_type
            && r.content.trim_end_matches('.') == content.trim_end_matches('.')
    })
}

/// The serial in the SOA record of a read-back record set.
pub fn soa_serial(records: &[DnsRecord]) -> u32 {
    records
        .iter()
        .find(|r| r.record_type == RecordType::SOA)
        .and_then(|soa| soa.content.split_whitespace().nth(2))
        .and_then(|serial| serial.parse().ok())
        .unwrap()
}

/// Mint a self-signed certificate and its key valid from `not_before` for `days`.
pub fn mint(names: &[&str], not_before: OffsetDateTime, days: i64) -> (String, String) {
    let mut params =
        rcgen::CertificateParams::new(names.iter().map(ToString::to_string).collect::<Vec<_>>())
            .unwrap();
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(days);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}
