//! sitewarden — a multi-site defacement-detection crawler.
//!
//! The pipeline discovers URLs from seed domains, fetches them (optionally
//! through a headless render), normalizes and fingerprints the content, and
//! depending on the configured mode records crawl metadata, persists
//! per-URL baselines, or compares live pages against stored baselines to
//! emit defacement verdicts.

pub mod compare;
pub mod config;
pub mod crawler;
pub mod fingerprint;
pub mod jobs;
pub mod models;
pub mod renderer;
pub mod storage;
