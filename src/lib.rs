//! Host Crab
//!
//! The control-plane core of a shared web hosting panel. Provisions domains onto a single
//! server by driving the programs that actually serve them: a DNS server ([BIND] or
//! [PowerDNS]), a web server ([Apache] or [Nginx]) and an ACME client ([certbot]).
//!
//! Every configuration change follows the same rule: render the new artifact, have the
//! daemon's own checker (`named-checkzone`, `pdnsutil check-zone`, `apache2ctl configtest`,
//! `nginx -t`) accept it, and only then activate it and reload the daemon. A rejected change
//! leaves the previous configuration serving.
//!
//! The [`Orchestrator`] is the entry point. It composes the drivers selected in the [`Config`]
//! into provisioning, deprovisioning, zone editing and certificate workflows, and runs the
//! renewal sweep the [`RenewalScheduler`] triggers.
//!
//! [BIND]: https://www.isc.org/bind/
//! [PowerDNS]: https://www.powerdns.com/
//! [Apache]: https://httpd.apache.org/
//! [Nginx]: https://nginx.org/
//! [certbot]: https://certbot.eff.org/
//!
#![warn(clippy::pedantic)]

pub mod clock;
pub mod config;
pub mod dns;
pub mod error;
pub mod locks;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod publish;
pub mod scheduler;
pub mod state_store;
pub mod system;
pub mod tls;
pub mod web;

#[cfg(test)]
mod test_utils;

pub use clock::{Clock, SystemClock};
pub use config::{Config, SharedConfig};
pub use error::{Error, Stage};
pub use notify::TracingNotifier;
pub use orchestrator::Orchestrator;
pub use scheduler::RenewalScheduler;
pub use state_store::{FileStateStore, MemoryStateStore};
pub use system::{FsArtifacts, SystemRunner};
