mod common;

use common::{has, Dns, Harness, Web, SERVER_IP};
use hostcrab::error::Error;
use hostcrab::model::RecordType;
use std::path::Path;

fn linked(h: &Harness, link: &str) -> bool {
    h.artifacts.is_linked(Path::new(link))
}

#[tokio::test]
async fn nginx_vhost_is_tested_before_reload() {
    let h = Harness::new(Dns::Bind, Web::Nginx);
    let domain = common::domain("example.com");
    h.web.create_virtual_host(&domain).await.unwrap();

    let vhost = h.file("/etc/nginx/sites-available/example.com.conf").unwrap();
    assert!(vhost.contains("server_name example.com www.example.com;"));
    assert!(vhost.contains("root /home/alice/example.com/public_html;"));
    assert!(linked(&h, "/etc/nginx/sites-enabled/example.com.conf"));
    assert_eq!(h.runner.lines(), vec!["nginx -t", "systemctl reload nginx"]);
}

#[tokio::test]
async fn apache_vhost_is_tested_before_reload() {
    let h = Harness::new(Dns::Bind, Web::Apache);
    let domain = common::domain("example.com");
    h.web.create_virtual_host(&domain).await.unwrap();

    let vhost = h
        .file("/etc/apache2/sites-available/example.com.conf")
        .unwrap();
    assert!(vhost.contains("ServerName example.com"));
    assert!(vhost.contains("ServerAlias www.example.com"));
    assert!(vhost.contains("DocumentRoot \"/home/alice/example.com/public_html\""));
    assert!(linked(&h, "/etc/apache2/sites-enabled/example.com.conf"));
    assert_eq!(
        h.runner.lines(),
        vec!["apache2ctl configtest", "systemctl reload apache2"]
    );
}

#[tokio::test]
async fn rejected_vhost_keeps_the_previous_one() {
    for web in [Web::Apache, Web::Nginx] {
        let h = Harness::new(Dns::Bind, web);
        let mut domain = common::domain("example.com");
        h.web.create_virtual_host(&domain).await.unwrap();
        let path = match web {
            Web::Apache => "/etc/apache2/sites-available/example.com.conf",
            Web::Nginx => "/etc/nginx/sites-available/example.com.conf",
        };
        let before = h.file(path).unwrap();
        let reloads = h.runner.count("systemctl reload");

        domain.document_root = "/home/alice/broken".into();
        let err = h.web.update_virtual_host(&domain).await.unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }), "{web:?}: {err:?}");
        assert_eq!(h.file(path).unwrap(), before, "{web:?}");
        assert_eq!(h.runner.count("systemctl reload"), reloads, "{web:?}");
    }
}

#[tokio::test]
async fn vhost_removal_is_idempotent() {
    let h = Harness::new(Dns::Bind, Web::Nginx);
    let domain = common::domain("example.com");
    h.web.create_virtual_host(&domain).await.unwrap();

    assert!(h.web.remove_virtual_host(&domain).await.unwrap());
    assert!(h.artifacts.files().is_empty());
    assert!(!linked(&h, "/etc/nginx/sites-enabled/example.com.conf"));

    let calls = h.runner.lines().len();
    assert!(!h.web.remove_virtual_host(&domain).await.unwrap());
    assert_eq!(h.runner.lines().len(), calls);
}

#[tokio::test]
async fn subdomain_gets_a_record_and_vhost() {
    let h = Harness::bind();
    h.orchestrator
        .provision(common::domain("example.com"), false)
        .await
        .unwrap();

    let blog = h
        .orchestrator
        .create_subdomain("example.com", "Blog", None)
        .await
        .unwrap();
    assert_eq!(blog.name, "blog");
    let vhost = h
        .file("/etc/nginx/sites-available/blog.example.com.conf")
        .unwrap();
    assert!(vhost.contains("server_name blog.example.com;"));
    assert!(vhost.contains("root /home/alice/example.com/public_html/blog;"));
    let records = h.orchestrator.records("example.com").await.unwrap();
    assert!(has(&records, "blog", RecordType::A, SERVER_IP));
    let stored = h.orchestrator.domain("example.com").await.unwrap();
    assert_eq!(stored.subdomains.len(), 1);

    assert!(h
        .orchestrator
        .remove_subdomain("example.com", "blog")
        .await
        .unwrap());
    assert!(h
        .file("/etc/nginx/sites-available/blog.example.com.conf")
        .is_none());
    let records = h.orchestrator.records("example.com").await.unwrap();
    assert!(!records.iter().any(|r| r.name == "blog"));
    assert!(!h
        .orchestrator
        .remove_subdomain("example.com", "blog")
        .await
        .unwrap());
}

#[tokio::test]
async fn subdomain_outside_home_is_rejected() {
    let h = Harness::bind();
    h.orchestrator
        .provision(common::domain("example.com"), false)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .create_subdomain("example.com", "shop", Some("/var/www/shop".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidDocumentRoot { .. }), "{err:?}");
    assert!(h
        .file("/etc/nginx/sites-available/shop.example.com.conf")
        .is_none());
}

#[tokio::test]
async fn suspension_disables_every_vhost() {
    let h = Harness::bind();
    h.orchestrator
        .provision(common::domain("example.com"), false)
        .await
        .unwrap();
    h.orchestrator
        .create_subdomain("example.com", "blog", None)
        .await
        .unwrap();

    h.orchestrator.suspend("example.com").await.unwrap();
    assert!(!linked(&h, "/etc/nginx/sites-enabled/example.com.conf"));
    assert!(!linked(&h, "/etc/nginx/sites-enabled/blog.example.com.conf"));
    assert!(h
        .file("/etc/nginx/sites-available/example.com.conf")
        .is_some());
    assert!(h.orchestrator.domain("example.com").await.unwrap().suspended);
    // The zone keeps being served.
    assert!(h.dns.records("example.com").await.unwrap().is_some());

    h.orchestrator.unsuspend("example.com").await.unwrap();
    assert!(linked(&h, "/etc/nginx/sites-enabled/example.com.conf"));
    assert!(linked(&h, "/etc/nginx/sites-enabled/blog.example.com.conf"));
    assert!(!h.orchestrator.domain("example.com").await.unwrap().suspended);
}

#[tokio::test]
async fn versions_are_parsed_per_server() {
    let nginx = Harness::new(Dns::Bind, Web::Nginx);
    assert_eq!(nginx.web.version().await.unwrap(), "1.24.0");
    let apache = Harness::new(Dns::Bind, Web::Apache);
    assert_eq!(apache.web.version().await.unwrap(), "2.4.58");
}
