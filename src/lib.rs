//! # label-backup
//! A container-aware backup agent: watches the local container runtime for
//! labels that declare a backup intent, runs database dumps on per-container
//! cron schedules, streams the gzipped output to a local directory or an
//! S3-compatible bucket, posts signed webhook notifications, and garbage
//! collects expired backups daily.

pub mod admin;
pub mod config;
pub mod context;
pub mod discovery;
pub mod dumper;
pub mod gc;
pub mod logger;
pub mod pipeline;
pub mod reconciler;
pub mod scheduler;
pub mod spec;
pub mod webhook;
pub mod writer;
