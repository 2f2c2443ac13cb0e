//! Nginx server block syntax.

use super::{version_after, Site, VhostFormat};
use crate::config::WebServerKind;
use crate::model::CertificatePaths;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, Default)]
pub struct Nginx;

impl Nginx {
    fn body(site: &Site, out: &mut String) {
        let _ = writeln!(
            out,
            "    server_name {};",
            site.hostnames().collect::<Vec<_>>().join(" ")
        );
        let _ = writeln!(out, "    root {};", site.document_root.display());
        let _ = writeln!(out, "    index index.html index.htm index.php;");
        let _ = writeln!(out, "    access_log {};", site.access_log.display());
        let _ = writeln!(out, "    error_log {};", site.error_log.display());
        let _ = writeln!(out);
        let _ = writeln!(out, "    location / {{");
        let _ = writeln!(out, "        try_files $uri $uri/ =404;");
        let _ = writeln!(out, "    }}");
    }
}

impl VhostFormat for Nginx {
    fn kind(&self) -> WebServerKind {
        WebServerKind::Nginx
    }

    fn render(&self, site: &Site) -> String {
        let mut out = String::from("# Managed by hostcrab. Local changes are overwritten.\n");
        out.push_str("server {\n    listen 80;\n    listen [::]:80;\n");
        Self::body(site, &mut out);
        out.push_str("}\n");
        out
    }

    fn render_ssl(&self, site: &Site, paths: &CertificatePaths) -> String {
        let mut out = String::from("# Managed by hostcrab. Local changes are overwritten.\n");
        out.push_str("server {\n    listen 443 ssl;\n    listen [::]:443 ssl;\n");
        Self::body(site, &mut out);
        // nginx wants the leaf and its chain in one file.
        let certificate = paths.full_chain.as_ref().unwrap_or(&paths.certificate);
        let _ = writeln!(out);
        let _ = writeln!(out, "    ssl_certificate {};", certificate.display());
        let _ = writeln!(out, "    ssl_certificate_key {};", paths.private_key.display());
        out.push_str("}\n");
        out
    }

    fn parse_version(&self, output: &str) -> Option<String> {
        version_after(output, "nginx")
    }
}
