//! Tests for cron normalization and the job table
//!

use core::time::Duration;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use label_backup::{
    config::Config,
    scheduler::{normalize_cron, ScheduleKind, Scheduler},
    webhook::Notifier,
};

mod common;

use common::test_spec;

#[test]
fn normalizes_five_field_expressions() {
    assert_eq!(normalize_cron("*/2 * * * *"), "0 */2 * * * *");
    assert_eq!(normalize_cron("  0 4 * * *  "), "0 0 4 * * *");
}

#[test]
fn leaves_six_field_and_macros_untouched() {
    assert_eq!(normalize_cron("0 */2 * * * *"), "0 */2 * * * *");
    assert_eq!(normalize_cron("@daily"), "@daily");
    assert_eq!(normalize_cron("@hourly"), "@hourly");
}

#[test]
fn five_and_six_field_forms_fire_identically() {
    let five = ScheduleKind::parse("*/2 * * * *").unwrap();
    let six = ScheduleKind::parse("0 */2 * * * *").unwrap();

    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();

    let mut five_at = start;
    let mut six_at = start;
    for _ in 0..5 {
        five_at = five.next_after(five_at).unwrap();
        six_at = six.next_after(six_at).unwrap();
        assert_eq!(five_at, six_at);
    }
}

#[test]
fn parses_macros_and_every() {
    assert!(ScheduleKind::parse("@daily").is_ok());

    let every = ScheduleKind::parse("@every 30s").unwrap();
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    assert_eq!(
        every.next_after(start).unwrap(),
        start + chrono::Duration::seconds(30)
    );
}

#[test]
fn rejects_invalid_expressions() {
    assert!(ScheduleKind::parse("not a cron").is_err());
    assert!(ScheduleKind::parse("@every soon").is_err());
}

fn test_config() -> Arc<Config> {
    let mut config = Config::from_env().unwrap();
    config.reconcile_interval = Duration::from_secs(10);
    config.concurrent_backup_limit = 4;
    config.backup_timeout = Duration::from_secs(60);
    Arc::new(config)
}

#[tokio::test]
async fn add_or_update_is_idempotent() {
    let config = test_config();
    let notifier = Arc::new(Notifier::new(&config.webhook).unwrap());
    let scheduler = Scheduler::new(config, notifier);

    let spec = test_spec();
    scheduler.add_or_update("c1", spec.clone()).unwrap();
    scheduler.add_or_update("c1", spec.clone()).unwrap();
    assert_eq!(scheduler.active_jobs(), 1);

    // A changed cron reschedules but still keeps one entry.
    let mut changed = spec;
    changed.cron = "*/5 * * * *".to_owned();
    scheduler.add_or_update("c1", changed).unwrap();
    assert_eq!(scheduler.active_jobs(), 1);

    scheduler.stop().await;
}

#[tokio::test]
async fn rejects_unschedulable_spec() {
    let config = test_config();
    let notifier = Arc::new(Notifier::new(&config.webhook).unwrap());
    let scheduler = Scheduler::new(config, notifier);

    let mut spec = test_spec();
    spec.cron = "nonsense".to_owned();
    assert!(scheduler.add_or_update("c1", spec).is_err());
    assert_eq!(scheduler.active_jobs(), 0);

    scheduler.stop().await;
}

#[tokio::test]
async fn remove_drops_the_job() {
    let config = test_config();
    let notifier = Arc::new(Notifier::new(&config.webhook).unwrap());
    let scheduler = Scheduler::new(config, notifier);

    scheduler.add_or_update("c1", test_spec()).unwrap();
    assert_eq!(scheduler.active_jobs(), 1);

    scheduler.remove("c1");
    assert_eq!(scheduler.active_jobs(), 0);

    // Removing an absent id is a no-op.
    scheduler.remove("c1");
    assert_eq!(scheduler.active_jobs(), 0);

    scheduler.stop().await;
}
