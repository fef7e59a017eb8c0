//! Integration testing module
//!
//! Scenario tests for the scheduling core:
//! - VoD startup with a bandwidth probe
//! - Live catch-up and sync positioning
//! - Dropped-frame backtracking
//! - Retry backoff and fatal escalation
//! - Immediate and smooth level switches
//! - Buffer-full recovery
//! - Playback progress / fragment change detection

pub mod playback;
