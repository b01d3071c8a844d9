//! Tests for the circuit breaker, payload shape, and request signing
//!

use core::time::Duration;

use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use label_backup::webhook::{sign, CircuitBreaker, NotificationPayload};
use sha2::Sha256;

#[test]
fn breaker_opens_after_threshold_and_recovers() {
    let breaker = CircuitBreaker::new(5, Duration::from_millis(50));

    // Four failures leave it closed.
    for _ in 0..4 {
        breaker.try_acquire().unwrap();
        breaker.record(false);
    }
    assert!(breaker.try_acquire().is_ok());

    // The fifth consecutive failure opens it: no further calls go through.
    breaker.record(false);
    assert!(breaker.try_acquire().is_err());
    assert!(breaker.try_acquire().is_err());

    // After the recovery timeout one probe is admitted.
    std::thread::sleep(Duration::from_millis(60));
    assert!(breaker.try_acquire().is_ok());
    // A concurrent call while the probe is in flight is refused.
    assert!(breaker.try_acquire().is_err());

    // A successful probe closes the breaker again.
    breaker.record(true);
    assert!(breaker.try_acquire().is_ok());
}

#[test]
fn breaker_reopens_on_failed_probe() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(50));

    breaker.try_acquire().unwrap();
    breaker.record(false);
    assert!(breaker.try_acquire().is_err());

    std::thread::sleep(Duration::from_millis(60));
    breaker.try_acquire().unwrap();
    breaker.record(false);

    // Straight back to open.
    assert!(breaker.try_acquire().is_err());
}

#[test]
fn breaker_success_resets_the_failure_count() {
    let breaker = CircuitBreaker::new(2, Duration::from_secs(60));

    breaker.try_acquire().unwrap();
    breaker.record(false);
    breaker.try_acquire().unwrap();
    breaker.record(true);
    breaker.try_acquire().unwrap();
    breaker.record(false);

    // One failure, one success, one failure: still under the threshold.
    assert!(breaker.try_acquire().is_ok());
}

#[test]
fn signature_matches_a_published_test_vector() {
    // RFC 4231 test case 2.
    assert_eq!(
        sign("Jefe", b"what do ya want for nothing?"),
        "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
    );
}

#[test]
fn signature_round_trips_over_the_raw_body() {
    let body = br#"{"container_id":"abc","success":true}"#;
    let header = sign("secret", body);

    let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
    mac.update(body);
    assert_eq!(header, hex::encode(mac.finalize().into_bytes()));

    assert_ne!(header, sign("other-secret", body));
}

#[test]
fn payload_serializes_with_the_wire_field_names() {
    let payload = NotificationPayload {
        container_id: "abc".to_owned(),
        container_name: "app-db".to_owned(),
        database_type: "postgres".to_owned(),
        database_name: None,
        destination_url: "/backups/pg/x.dump.gz".to_owned(),
        success: true,
        error: None,
        backup_size_bytes: Some(2048),
        duration_seconds: 1.25,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        cron_schedule: Some("*/1 * * * *".to_owned()),
        backup_prefix: Some("pg".to_owned()),
        destination_type: Some("local".to_owned()),
    };

    let value = serde_json::to_value(&payload).unwrap();
    let object = value.as_object().unwrap();

    assert_eq!(object["container_id"], "abc");
    assert_eq!(object["backup_size_bytes"], 2048);
    assert_eq!(object["destination_type"], "local");
    assert!(object.contains_key("timestamp_utc"));

    // Optional fields are omitted, not null.
    assert!(!object.contains_key("database_name"));
    assert!(!object.contains_key("error"));
}
