use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::borrow::Cow;
use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use trust_dns_proto::rr::Name;

pub type SharedConfig = Arc<Config>;

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub server_ip: Ipv4Addr,
    #[serde(default)]
    pub server_ipv6: Option<Ipv6Addr>,
    pub nameservers: Vec<String>,
    pub hostmaster: String,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    pub web_server: WebServerConfig,
    pub dns: DnsConfig,
    #[serde(default)]
    pub zone_defaults: ZoneDefaults,
    pub tls: TlsConfig,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_command_timeout")]
    pub command_timeout: Duration,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WebServerKind {
    Apache,
    Nginx,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DnsKind {
    Bind,
    #[serde(rename = "powerdns")]
    PowerDns,
}

/// Paths and commands for the `sites-available`/`sites-enabled` layout shared by the Debian
/// Apache and Nginx packages. Every field defaults per [`WebServerKind`].
#[derive(Deserialize, Debug, Clone)]
pub struct WebServerConfig {
    pub kind: WebServerKind,
    #[serde(default)]
    pub sites_available: Option<PathBuf>,
    #[serde(default)]
    pub sites_enabled: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub test_command: Option<Vec<String>>,
    #[serde(default)]
    pub reload_command: Option<Vec<String>>,
    #[serde(default)]
    pub restart_command: Option<Vec<String>>,
    #[serde(default)]
    pub version_command: Option<Vec<String>>,
}

impl WebServerConfig {
    fn daemon(&self) -> &'static str {
        match self.kind {
            WebServerKind::Apache => "apache2",
            WebServerKind::Nginx => "nginx",
        }
    }

    pub fn sites_available(&self) -> PathBuf {
        self.sites_available
            .clone()
            .unwrap_or_else(|| Path::new("/etc").join(self.daemon()).join("sites-available"))
    }

    pub fn sites_enabled(&self) -> PathBuf {
        self.sites_enabled
            .clone()
            .unwrap_or_else(|| Path::new("/etc").join(self.daemon()).join("sites-enabled"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| Path::new("/var/log").join(self.daemon()))
    }

    pub fn test_command(&self) -> Vec<String> {
        self.test_command.clone().unwrap_or_else(|| match self.kind {
            WebServerKind::Apache => argv(&["apache2ctl", "configtest"]),
            WebServerKind::Nginx => argv(&["nginx", "-t"]),
        })
    }

    pub fn reload_command(&self) -> Vec<String> {
        self.reload_command
            .clone()
            .unwrap_or_else(|| argv(&["systemctl", "reload", self.daemon()]))
    }

    pub fn restart_command(&self) -> Vec<String> {
        self.restart_command
            .clone()
            .unwrap_or_else(|| argv(&["systemctl", "restart", self.daemon()]))
    }

    pub fn version_command(&self) -> Vec<String> {
        self.version_command
            .clone()
            .unwrap_or_else(|| argv(&[self.daemon(), "-v"]))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DnsConfig {
    Bind(BindConfig),
    #[serde(rename = "powerdns")]
    PowerDns(PowerDnsConfig),
}

impl DnsConfig {
    pub fn kind(&self) -> DnsKind {
        match self {
            DnsConfig::Bind(_) => DnsKind::Bind,
            DnsConfig::PowerDns(_) => DnsKind::PowerDns,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct BindConfig {
    #[serde(default = "default_zone_dir")]
    pub zone_dir: PathBuf,
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,
    #[serde(default = "default_checkzone")]
    pub check_command: Vec<String>,
    #[serde(default = "default_rndc_reload")]
    pub reload_command: Vec<String>,
    #[serde(default = "default_rndc_reconfig")]
    pub reconfig_command: Vec<String>,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            zone_dir: default_zone_dir(),
            index_path: default_index_path(),
            check_command: default_checkzone(),
            reload_command: default_rndc_reload(),
            reconfig_command: default_rndc_reconfig(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PowerDnsConfig {
    /// The database of the server's generic SQL backend.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_pdnsutil_check")]
    pub check_command: Vec<String>,
    #[serde(default = "default_pdns_reload")]
    pub reload_command: Vec<String>,
    #[serde(default = "default_pdns_purge")]
    pub purge_command: Vec<String>,
}

impl Default for PowerDnsConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            check_command: default_pdnsutil_check(),
            reload_command: default_pdns_reload(),
            purge_command: default_pdns_purge(),
        }
    }
}

/// SOA timers for new zones. The defaults are the RIPE-203 recommendations.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct ZoneDefaults {
    pub ttl: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

impl Default for ZoneDefaults {
    fn default() -> Self {
        // See RIPE 203[0] for recommended values.
        // [0]: https://www.ripe.net/publications/docs/ripe-203
        Self {
            ttl: 14_400,
            refresh: 86_400,   // 24 hrs.
            retry: 7_200,      // 2 hours.
            expire: 3_600_000, // 1000 hours.
            minimum: 172_800,  // 2 days.
        }
    }
}

#[serde_as]
#[derive(Deserialize, Debug, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_ssl_dir")]
    pub ssl_dir: PathBuf,
    /// Base64 encoded 32 byte AES-256-GCM key used to seal private keys at rest.
    pub seal_key: String,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_acme_timeout")]
    pub acme_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval: Duration,
    pub acme: AcmeConfig,
}

impl TlsConfig {
    pub fn seal_key_bytes(&self) -> Result<[u8; 32], Error> {
        let raw = STANDARD
            .decode(self.seal_key.trim())
            .map_err(|err| Error::Config(format!("seal_key is not valid base64: {err}")))?;
        raw.try_into().map_err(|raw: Vec<u8>| {
            Error::Config(format!("seal_key must be 32 bytes, found {}", raw.len()))
        })
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcmeConfig {
    Certbot {
        #[serde(default = "default_certbot")]
        program: String,
        email: String,
        #[serde(default = "default_live_dir")]
        live_dir: PathBuf,
        #[serde(default)]
        staging: bool,
    },
    SelfSigned {
        #[serde(default = "default_validity_days")]
        validity_days: u32,
    },
}

impl Config {
    pub fn try_from_file(p: impl AsRef<Path>) -> Result<Self, Error> {
        let f = File::open(p)?;
        let reader = BufReader::new(f);
        let conf: Config = serde_json::from_reader(reader)?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.nameservers.is_empty() {
            return Err(Error::Config("at least one nameserver is required".into()));
        }
        for ns in &self.nameservers {
            Name::from_str(ns).map_err(|_| Error::Config(format!("invalid nameserver \"{ns}\"")))?;
        }
        self.hostmaster()?;
        self.tls.seal_key_bytes()?;
        Ok(())
    }

    /// The hostmaster in SOA RNAME form, without a trailing dot.
    pub fn hostmaster(&self) -> Result<String, Error> {
        let sanitized = self.sanitized_hostmaster();
        Name::from_str(&sanitized)?;
        Ok(sanitized.trim_end_matches('.').to_string())
    }

    fn sanitized_hostmaster(&self) -> Cow<str> {
        match self.hostmaster.split_once('@') {
            Some((user, domain)) => {
                let user = user.replace('.', "\\.");
                Cow::Owned(format!("{user}.{domain}"))
            }
            _ => Cow::Borrowed(&self.hostmaster),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_zone_dir() -> PathBuf {
    PathBuf::from("/etc/bind/zones")
}

fn default_index_path() -> PathBuf {
    PathBuf::from("/etc/bind/named.conf.hostcrab")
}

fn default_checkzone() -> Vec<String> {
    argv(&["named-checkzone"])
}

fn default_rndc_reload() -> Vec<String> {
    argv(&["rndc", "reload"])
}

fn default_rndc_reconfig() -> Vec<String> {
    argv(&["rndc", "reconfig"])
}

fn default_database_url() -> String {
    "sqlite:///var/lib/powerdns/pdns.sqlite3?mode=rw".to_string()
}

fn default_pdnsutil_check() -> Vec<String> {
    argv(&["pdnsutil", "check-zone"])
}

fn default_pdns_reload() -> Vec<String> {
    argv(&["pdns_control", "reload"])
}

fn default_pdns_purge() -> Vec<String> {
    argv(&["pdns_control", "purge"])
}

fn default_ssl_dir() -> PathBuf {
    PathBuf::from("/etc/hostcrab/ssl")
}

fn default_renew_before_days() -> u32 {
    30
}

fn default_acme_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_renewal_interval() -> Duration {
    Duration::from_secs(86_400)
}

fn default_certbot() -> String {
    "certbot".into()
}

fn default_live_dir() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_validity_days() -> u32 {
    90
}
