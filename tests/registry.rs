// tests/registry.rs
use chrono::{TimeZone, Utc};

use sustainability_ingest::ingest::types::SourceCursor;
use sustainability_ingest::registry::{
    Registration, RegistrationError, SourceRegistry, DEFAULT_INSTANCE_PREFIX, MSG_NAME_REQUIRED,
    MSG_URL_REQUIRED, MSG_URL_TAKEN,
};

fn slot() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 10, 0, 0).unwrap()
}

fn reg(name: &str, url: &str) -> Registration {
    Registration {
        source_name: name.into(),
        feed_url: url.into(),
    }
}

#[test]
fn registration_creates_an_active_instance() {
    let r = SourceRegistry::new(DEFAULT_INSTANCE_PREFIX, 500);
    let now = Utc.with_ymd_and_hms(2024, 1, 10, 10, 0, 0).unwrap();
    let src = r
        .register_at(reg("Test Sustainability News", "https://test-sustainability.com/feed/"), now)
        .unwrap();

    assert_eq!(src.id, "test-sustainability-news");
    assert_eq!(src.instance_name, "[Marama] - Test Sustainability News News Scrapper");
    assert_eq!(src.feed_url.as_str(), "https://test-sustainability.com/feed/");
    assert!(src.active);
    assert_eq!(src.created_at, now);
    assert_eq!(src.cursor.capacity, 500);
    assert_eq!(r.active_sources().len(), 1);
}

#[test]
fn invalid_payload_lists_every_problem() {
    let r = SourceRegistry::new(DEFAULT_INSTANCE_PREFIX, 500);
    let err = r.register_source(reg("   ", "test-sustainability.com/feed")).unwrap_err();
    assert_eq!(
        err,
        RegistrationError::Invalid {
            problems: vec![MSG_NAME_REQUIRED.to_string(), MSG_URL_REQUIRED.to_string()]
        }
    );
    assert!(r.list().is_empty());
}

#[test]
fn same_feed_url_cannot_register_twice() {
    let r = SourceRegistry::new(DEFAULT_INSTANCE_PREFIX, 500);
    r.register_source(reg("Grist", "https://grist.org/feed/")).unwrap();
    let err = r.register_source(reg("Grist Again", "https://grist.org/feed/")).unwrap_err();
    assert_eq!(err.problems(), vec![MSG_URL_TAKEN.to_string()]);
    assert_eq!(r.list().len(), 1);
}

#[test]
fn seeding_is_idempotent() {
    let r = SourceRegistry::new(DEFAULT_INSTANCE_PREFIX, 500);
    let seeds = vec![
        reg("Earth.Org", "https://earth.org/feed/"),
        reg("Grist", "https://grist.org/feed/"),
        reg("", "nope"),
    ];
    assert_eq!(r.seed(&seeds), 2);
    assert_eq!(r.seed(&seeds), 0);
    let ids: Vec<_> = r.list().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec!["earth-org", "grist"]);
}

#[test]
fn deactivation_keeps_the_record() {
    let r = SourceRegistry::new(DEFAULT_INSTANCE_PREFIX, 500);
    let id = r.register_source(reg("Grist", "https://grist.org/feed/")).unwrap().id;
    let off = r.deactivate(&id).unwrap();
    assert!(!off.active);
    assert!(r.active_sources().is_empty());
    assert_eq!(r.list().len(), 1);
    assert!(r.deactivate("unknown").is_none());
}

#[test]
fn registry_survives_reopen_with_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state/sources.json");

    let id = {
        let r = SourceRegistry::open(&path, DEFAULT_INSTANCE_PREFIX, 50).unwrap();
        let id = r.register_source(reg("Grist", "https://grist.org/feed/")).unwrap().id;
        let start = SourceCursor::with_capacity(50);
        let mut cursor = start.clone();
        cursor.remember("guid-1");
        assert!(r.advance_cursor(&id, cursor.committed_by(slot(), &start)));
        assert!(!r.advance_cursor("missing", SourceCursor::default()));
        id
    };
    assert!(path.exists());
    assert!(!path.with_extension("json.tmp").exists());

    let reopened = SourceRegistry::open(&path, DEFAULT_INSTANCE_PREFIX, 50).unwrap();
    let src = reopened.get(&id).unwrap();
    assert!(src.cursor.has_seen("guid-1"));
    assert_eq!(src.cursor.committed_run, Some(slot()));
    assert!(!src.cursor.baseline_for(slot()).has_seen("guid-1"));
    assert_eq!(src.display_name, "Grist");
}

#[test]
fn corrupt_registry_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sources.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = SourceRegistry::open(&path, DEFAULT_INSTANCE_PREFIX, 50).err().unwrap();
    assert!(format!("{err:#}").contains("parsing source registry"));
}
