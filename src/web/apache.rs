//! Apache httpd vhost syntax.

use super::{version_after, Site, VhostFormat};
use crate::config::WebServerKind;
use crate::model::CertificatePaths;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, Default)]
pub struct Apache;

impl Apache {
    fn body(site: &Site, out: &mut String) {
        let _ = writeln!(out, "    ServerName {}", site.server_name);
        for alias in &site.aliases {
            let _ = writeln!(out, "    ServerAlias {alias}");
        }
        let root = site.document_root.display();
        let _ = writeln!(out, "    DocumentRoot \"{root}\"");
        let _ = writeln!(out, "    <IfModule mpm_itk_module>");
        let _ = writeln!(
            out,
            "        AssignUserId {} #{}",
            site.account.username, site.account.gid
        );
        let _ = writeln!(out, "    </IfModule>");
        let _ = writeln!(out, "    <Directory \"{root}\">");
        let _ = writeln!(out, "        Options -Indexes +FollowSymLinks");
        let _ = writeln!(out, "        AllowOverride All");
        let _ = writeln!(out, "        Require all granted");
        let _ = writeln!(out, "    </Directory>");
        let _ = writeln!(out, "    ErrorLog {}", site.error_log.display());
        let _ = writeln!(out, "    CustomLog {} combined", site.access_log.display());
    }
}

impl VhostFormat for Apache {
    fn kind(&self) -> WebServerKind {
        WebServerKind::Apache
    }

    fn render(&self, site: &Site) -> String {
        let mut out = String::from("# Managed by hostcrab. Local changes are overwritten.\n");
        out.push_str("<VirtualHost *:80>\n");
        Self::body(site, &mut out);
        out.push_str("</VirtualHost>\n");
        out
    }

    fn render_ssl(&self, site: &Site, paths: &CertificatePaths) -> String {
        let mut out = String::from("# Managed by hostcrab. Local changes are overwritten.\n");
        out.push_str("<IfModule mod_ssl.c>\n<VirtualHost *:443>\n");
        Self::body(site, &mut out);
        let _ = writeln!(out, "    SSLEngine on");
        let _ = writeln!(out, "    SSLCertificateFile {}", paths.certificate.display());
        let _ = writeln!(out, "    SSLCertificateKeyFile {}", paths.private_key.display());
        if let Some(chain) = &paths.chain {
            let _ = writeln!(out, "    SSLCertificateChainFile {}", chain.display());
        }
        out.push_str("</VirtualHost>\n</IfModule>\n");
        out
    }

    fn parse_version(&self, output: &str) -> Option<String> {
        version_after(output, "Apache")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Domain, DomainKind};
    use crate::test_utils::account;
    use std::path::Path;

    #[test]
    fn renders_plain_and_ssl_vhosts() {
        let domain = Domain::new(
            "example.com",
            account(),
            "/home/alice/public_html",
            DomainKind::Primary,
        );
        let site = Site::for_domain(&domain, Path::new("/var/log/apache2"));

        let plain = Apache.render(&site);
        assert!(plain.contains("<VirtualHost *:80>"));
        assert!(plain.contains("ServerName example.com\n"));
        assert!(plain.contains("ServerAlias www.example.com\n"));
        assert!(plain.contains("DocumentRoot \"/home/alice/public_html\""));
        assert!(plain.contains("ErrorLog /var/log/apache2/example.com.error.log"));

        let paths = CertificatePaths {
            certificate: "/etc/hostcrab/ssl/example.com/cert.pem".into(),
            private_key: "/etc/hostcrab/ssl/example.com/privkey.pem".into(),
            chain: None,
            full_chain: None,
        };
        let ssl = Apache.render_ssl(&site, &paths);
        assert!(ssl.contains("<VirtualHost *:443>"));
        assert!(ssl.contains("SSLCertificateKeyFile /etc/hostcrab/ssl/example.com/privkey.pem"));
        assert!(!ssl.contains("SSLCertificateChainFile"));
    }
}
