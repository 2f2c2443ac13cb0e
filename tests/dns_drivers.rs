mod common;

use common::{has, soa_serial, Dns, Harness, Web, BROKEN, SERVER_IP};
use hostcrab::error::{Error, Stage};
use hostcrab::orchestrator::StepOutcome;
use hostcrab::model::{DnsRecord, RecordType};

async fn provisioned(dns: Dns) -> Harness {
    let h = Harness::new(dns, Web::Nginx);
    let report = h
        .orchestrator
        .provision(common::domain("example.com"), false)
        .await
        .unwrap();
    assert!(report.is_complete(), "{report:?}");
    h
}

#[tokio::test]
async fn published_zone_reads_back_for_both_backends() {
    for dns in [Dns::Bind, Dns::PowerDns] {
        let h = provisioned(dns).await;
        h.orchestrator
            .add_record(
                "example.com",
                DnsRecord::new("blog", RecordType::CNAME, "www.example.com", 3600),
            )
            .await
            .unwrap();
        h.orchestrator
            .add_record(
                "example.com",
                DnsRecord::new("@", RecordType::MX, "mx2.example.net.", 3600).with_priority(20),
            )
            .await
            .unwrap();

        let served = h.dns.records("example.com").await.unwrap().unwrap();
        assert!(has(&served, "@", RecordType::NS, "ns1.example.net"), "{dns:?}");
        assert!(has(&served, "@", RecordType::NS, "ns2.example.net"), "{dns:?}");
        assert!(has(&served, "@", RecordType::A, SERVER_IP), "{dns:?}");
        assert!(has(&served, "www", RecordType::A, SERVER_IP), "{dns:?}");
        assert!(has(&served, "@", RecordType::MX, "mail.example.com"), "{dns:?}");
        assert!(has(&served, "@", RecordType::MX, "mx2.example.net"), "{dns:?}");
        assert!(has(&served, "blog", RecordType::CNAME, "www.example.com"), "{dns:?}");
        assert_eq!(soa_serial(&served), 2026101803, "{dns:?}");

        let mx2 = served
            .iter()
            .find(|r| r.content.starts_with("mx2."))
            .unwrap();
        assert_eq!(mx2.priority, Some(20), "{dns:?}");
    }
}

#[tokio::test]
async fn serials_increase_within_a_day_and_restart_the_next() {
    let h = provisioned(Dns::Bind).await;
    let zone = || h.orchestrator.zone("example.com");
    assert_eq!(zone().await.unwrap().serial, 2026101801);

    let mut serials = Vec::new();
    for host in ["a", "b", "c"] {
        h.orchestrator
            .add_record(
                "example.com",
                DnsRecord::new(host, RecordType::A, "198.51.100.7", 3600),
            )
            .await
            .unwrap();
        serials.push(zone().await.unwrap().serial);
    }
    assert_eq!(serials, vec![2026101802, 2026101803, 2026101804]);

    h.advance_days(1);
    h.orchestrator
        .add_record(
            "example.com",
            DnsRecord::new("d", RecordType::A, "198.51.100.7", 3600),
        )
        .await
        .unwrap();
    assert_eq!(zone().await.unwrap().serial, 2026101901);

    let served = h.dns.records("example.com").await.unwrap().unwrap();
    assert_eq!(soa_serial(&served), 2026101901);
}

#[tokio::test]
async fn rejected_bind_zone_is_never_activated() {
    let h = provisioned(Dns::Bind).await;
    let live = "/etc/bind/zones/example.com.db";
    let before = h.file(live).unwrap();
    let reloads = h.runner.count("rndc reload");

    let err = h
        .orchestrator
        .add_record(
            "example.com",
            DnsRecord::new("@", RecordType::TXT, BROKEN, 3600),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Invalid { .. }), "{err:?}");
    assert_eq!(err.stage(), Some(Stage::Validate));

    assert_eq!(h.file(live).unwrap(), before);
    assert!(h.file("/etc/bind/zones/example.com.db.staged").is_none());
    assert_eq!(h.runner.count("rndc reload"), reloads);
    let zone = h.orchestrator.zone("example.com").await.unwrap();
    assert_eq!(zone.serial, 2026101801);
    let records = h.orchestrator.records("example.com").await.unwrap();
    assert!(!records.iter().any(|r| r.content == BROKEN));
}

#[tokio::test]
async fn rejected_powerdns_rows_are_restored() {
    let h = provisioned(Dns::PowerDns).await;
    let before = h.dns.records("example.com").await.unwrap();
    let purges = h.runner.count("pdns_control purge");

    h.runner.fail("pdnsutil check-zone");
    let err = h
        .orchestrator
        .add_record(
            "example.com",
            DnsRecord::new("shop", RecordType::A, "198.51.100.7", 3600),
        )
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Validate));

    assert_eq!(h.dns.records("example.com").await.unwrap(), before);
    assert_eq!(h.runner.count("pdns_control purge"), purges);
    assert_eq!(
        h.orchestrator.zone("example.com").await.unwrap().serial,
        2026101801
    );

    h.runner.clear_failures();
    h.orchestrator
        .add_record(
            "example.com",
            DnsRecord::new("shop", RecordType::A, "198.51.100.7", 3600),
        )
        .await
        .unwrap();
    let served = h.dns.records("example.com").await.unwrap().unwrap();
    assert!(has(&served, "shop", RecordType::A, "198.51.100.7"));
    assert_eq!(soa_serial(&served), 2026101802);
}

#[tokio::test]
async fn last_apex_nameserver_is_protected() {
    let h = provisioned(Dns::Bind).await;
    let ns: Vec<DnsRecord> = h
        .orchestrator
        .records("example.com")
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.is_apex() && r.record_type == RecordType::NS)
        .collect();
    assert_eq!(ns.len(), 2);

    h.orchestrator
        .remove_record("example.com", ns[0].id)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .remove_record("example.com", ns[1].id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProtectedRecord(_)), "{err:?}");
}

#[tokio::test]
async fn reset_restores_default_records() {
    let h = provisioned(Dns::PowerDns).await;
    let defaults = h.orchestrator.records("example.com").await.unwrap();
    h.orchestrator
        .add_record(
            "example.com",
            DnsRecord::new("shop", RecordType::A, "198.51.100.7", 3600),
        )
        .await
        .unwrap();

    let reset = h.orchestrator.reset_zone("example.com").await.unwrap();
    assert_eq!(reset.len(), defaults.len());
    assert!(reset
        .iter()
        .zip(&defaults)
        .all(|(after, before)| after.same_data(before)));
    assert_eq!(
        h.orchestrator.zone("example.com").await.unwrap().serial,
        2026101803
    );
}

#[tokio::test]
async fn removing_an_absent_zone_is_a_noop() {
    for dns in [Dns::Bind, Dns::PowerDns] {
        let h = Harness::new(dns, Web::Nginx);
        assert!(!h.dns.remove_zone("absent.example").await.unwrap(), "{dns:?}");
        assert!(h.runner.lines().is_empty(), "{dns:?}");
    }
}

#[tokio::test]
async fn removed_bind_zone_leaves_the_index() {
    let h = provisioned(Dns::Bind).await;
    let index = "/etc/bind/named.conf.hostcrab";
    assert!(h.file(index).unwrap().contains("example.com.conf"));

    assert!(h.dns.remove_zone("example.com").await.unwrap());
    assert!(!h.file(index).unwrap().contains("example.com.conf"));
    assert!(h.file("/etc/bind/zones/example.com.db").is_none());
    assert!(h.dns.records("example.com").await.unwrap().is_none());
    assert!(h.runner.count("rndc reconfig") >= 2);
}

#[tokio::test]
async fn failed_bind_reconfig_is_retried() {
    let h = Harness::bind();
    let index = "/etc/bind/named.conf.hostcrab";
    h.runner.fail("rndc reconfig");
    let report = h
        .orchestrator
        .provision(common::domain("example.com"), false)
        .await
        .unwrap();
    assert!(matches!(
        report.zone,
        StepOutcome::Failed {
            stage: Some(Stage::Reload),
            ..
        }
    ));
    // The server never heard of the zone, so the index doesn't claim it.
    assert!(h.file(index).is_none());
    assert!(h.file("/etc/bind/zones/example.com.conf").is_some());

    h.runner.clear_failures();
    let reconfigs = h.runner.count("rndc reconfig");
    let report = h
        .orchestrator
        .provision(common::domain("example.com"), false)
        .await
        .unwrap();
    assert!(report.is_complete(), "{report:?}");
    assert_eq!(h.runner.count("rndc reconfig"), reconfigs + 1);
    assert!(h.file(index).unwrap().contains("example.com.conf"));
}

#[tokio::test]
async fn failed_bind_reconfig_on_removal_is_retried() {
    let h = provisioned(Dns::Bind).await;
    let index = "/etc/bind/named.conf.hostcrab";

    h.runner.fail("rndc reconfig");
    let err = h.dns.remove_zone("example.com").await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Reload));
    assert!(h.file(index).unwrap().contains("example.com.conf"));
    assert!(h.file("/etc/bind/zones/example.com.db").is_some());

    h.runner.clear_failures();
    assert!(h.dns.remove_zone("example.com").await.unwrap());
    assert!(!h.file(index).unwrap().contains("example.com.conf"));
    assert!(h.file("/etc/bind/zones/example.com.conf").is_none());
    assert!(h.file("/etc/bind/zones/example.com.db").is_none());
}

#[tokio::test]
async fn activated_serial_is_kept_when_the_reload_fails() {
    let h = provisioned(Dns::Bind).await;
    h.runner.fail("rndc reload");
    let err = h
        .orchestrator
        .add_record(
            "example.com",
            DnsRecord::new("a", RecordType::A, "198.51.100.7", 3600),
        )
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Reload));
    // The new zone file is live and only waits for the server to load it.
    assert_eq!(h.orchestrator.zone("example.com").await.unwrap().serial, 2026101802);

    h.runner.clear_failures();
    h.orchestrator
        .add_record(
            "example.com",
            DnsRecord::new("b", RecordType::A, "198.51.100.8", 3600),
        )
        .await
        .unwrap();
    assert_eq!(h.orchestrator.zone("example.com").await.unwrap().serial, 2026101803);
    let served = h.dns.records("example.com").await.unwrap().unwrap();
    assert_eq!(soa_serial(&served), 2026101803);
    assert!(has(&served, "a", RecordType::A, "198.51.100.7"));
    assert!(has(&served, "b", RecordType::A, "198.51.100.8"));
}
