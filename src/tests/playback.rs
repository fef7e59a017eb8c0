//! Playback progress, seeks, key loads, and stream coordination

use std::sync::Arc;
use std::time::Duration;

use crate::config::StreamConfig;
use crate::events::Event;
use crate::level::Level;
use crate::media::ReadyState;
use crate::scheduler::{run_ticker, SchedulerState, StreamScheduler};
use crate::tests::fixtures::{
    details, two_levels, Harness, RecordingLoader, StubTransmuxer,
};
use crate::types::StreamKind;

fn vod_harness(fragments: u64) -> Harness {
    let mut config = StreamConfig::default();
    config.test_bandwidth = false;
    let mut h = Harness::with_levels(config, two_levels());
    h.scheduler.handle_event(Event::LevelLoaded {
        level: 0,
        details: details(0, 0, fragments, 4.0, 0.0, false),
    });
    h.set_playhead(0.0, ReadyState::HaveEnoughData, false);
    h.scheduler.start_load(None);
    h
}

// Successive FragChanged emissions carry strictly increasing fragment
// starts while the playhead only moves forward.
#[test]
fn test_frag_changed_monotone() {
    let mut h = vod_harness(6);
    h.complete_current_load();
    h.complete_current_load();
    h.complete_current_load();
    h.scheduler.drain_events();

    let mut changed_starts: Vec<f64> = Vec::new();
    for &time in &[0.5, 1.0, 4.5, 4.4, 9.0] {
        h.media.lock().current_time = time;
        h.scheduler.tick();
        for event in h.scheduler.drain_events() {
            if let Event::FragChanged { frag } = event {
                let start = h.scheduler.levels.fragment(frag).unwrap().start;
                changed_starts.push(start);
            }
        }
    }

    assert_eq!(changed_starts.len(), 3);
    assert!(changed_starts.windows(2).all(|w| w[1] > w[0]));
}

// Playing into a fragment of a different level announces the switch.
#[test]
fn test_level_switched_on_playback() {
    let mut h = vod_harness(6);
    h.complete_current_load();
    h.media.lock().current_time = 1.0;
    h.scheduler.tick();

    h.scheduler.set_level(1).unwrap();
    h.scheduler.handle_event(Event::FragLoadEmergencyAborted);
    h.scheduler.handle_event(Event::LevelLoaded {
        level: 1,
        details: details(1, 0, 6, 4.0, 0.0, false),
    });
    let frag = h.last_loaded_fragment().unwrap();
    assert_eq!(frag.level, 1);
    h.complete_current_load();
    h.scheduler.drain_events();

    h.media.lock().current_time = 5.0;
    h.scheduler.tick();
    let events = h.scheduler.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::FragChanged { frag } if frag.level == 1)));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::LevelSwitched { level: 1 })));
}

// A live level whose playlist is not the freshest load parks the
// scheduler in WaitingLevel until its playlist arrives.
#[test]
fn test_waiting_level_on_stale_live_playlist() {
    let mut config = StreamConfig::default();
    config.test_bandwidth = false;
    let mut h = Harness::with_levels(config, two_levels());
    h.scheduler.handle_event(Event::LevelLoaded {
        level: 1,
        details: details(1, 10, 6, 6.0, 0.0, true),
    });
    h.scheduler.handle_event(Event::LevelLoaded {
        level: 0,
        details: details(0, 10, 6, 6.0, 0.0, true),
    });

    // level 1 has details, but level 0 was loaded after it
    h.scheduler.set_level(1).unwrap();
    h.scheduler.start_load(None);
    assert_eq!(h.scheduler.state(), SchedulerState::WaitingLevel);
    assert_eq!(h.loaded_count(), 0);

    h.scheduler.handle_event(Event::LevelLoaded {
        level: 1,
        details: details(1, 10, 6, 6.0, 0.0, true),
    });
    assert_eq!(h.loaded_count(), 1);
    assert_eq!(h.last_loaded_fragment().unwrap().level, 1);
}

// A live playlist that momentarily slid back behind the buffer is left
// alone until the next refresh.
#[test]
fn test_live_slid_back_waits() {
    let mut config = StreamConfig::default();
    config.test_bandwidth = false;
    let mut h = Harness::with_levels(config, vec![Level::new(800_000, "l0.m3u8".into())]);
    h.scheduler.handle_event(Event::LevelLoaded {
        level: 0,
        details: details(0, 0, 3, 6.0, 0.0, true),
    });
    h.set_playhead(0.0, ReadyState::HaveEnoughData, false);
    h.scheduler.start_load(None);
    h.complete_current_load();
    let count = h.loaded_count();

    // buffer extends past the playlist edge (18s); abandoning the
    // in-flight load must not trigger a re-load of the edge
    h.set_buffered(vec![(0.0, 30.0)]);
    h.scheduler.handle_event(Event::FragLoadEmergencyAborted);
    h.scheduler.tick();
    assert_eq!(h.loaded_count(), count);
    assert_eq!(h.scheduler.state(), SchedulerState::Idle);
}

// Seeking outside the in-flight fragment aborts it and reloads from the
// seek target.
#[test]
fn test_seek_aborts_inflight_load() {
    let mut h = vod_harness(10);
    h.complete_current_load();
    assert_eq!(h.last_loaded_fragment().unwrap().sn, 1);
    let aborts_before = h.loader.lock().aborts;

    {
        let mut m = h.media.lock();
        m.current_time = 20.0;
        m.seeking = true;
    }
    h.scheduler.on_media_seeking();
    assert_eq!(h.loader.lock().aborts, aborts_before + 1);
    assert_eq!(h.last_loaded_fragment().unwrap().sn, 5);

    h.media.lock().seeking = false;
    h.scheduler.on_media_seeked();
}

// An encrypted fragment waits for its key, then loads.
#[test]
fn test_key_load_sequencing() {
    let mut config = StreamConfig::default();
    config.test_bandwidth = false;
    let mut h = Harness::with_levels(config, vec![Level::new(800_000, "l0.m3u8".into())]);
    let mut d = details(0, 0, 5, 4.0, 0.0, false);
    for frag in &mut d.fragments {
        frag.encrypted = true;
    }
    h.scheduler.handle_event(Event::LevelLoaded {
        level: 0,
        details: d,
    });
    h.scheduler.start_load(None);

    assert_eq!(h.scheduler.state(), SchedulerState::KeyLoading);
    assert_eq!(h.loaded_count(), 0);
    let key_request = h
        .scheduler
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            Event::KeyLoading { frag } => Some(frag),
            _ => None,
        })
        .expect("key requested");
    assert_eq!(key_request.sn, 0);

    h.scheduler.handle_event(Event::KeyLoaded { frag: key_request });
    assert_eq!(h.scheduler.state(), SchedulerState::FragLoading);
    assert_eq!(h.loaded_count(), 1);
}

// Audio track switches: back to main regenerates init data; to an
// alternate rendition flushes the muxed audio.
#[test]
fn test_audio_track_switching() {
    let mut h = vod_harness(6);
    h.complete_current_load();
    h.scheduler.drain_events();

    h.scheduler.handle_event(Event::AudioTrackSwitching {
        id: 1,
        url: Some("audio_en.m3u8".into()),
    });
    h.scheduler.handle_event(Event::AudioTrackSwitched { id: 1 });
    assert!(h.scheduler.alt_audio);
    let flushed_audio = h.scheduler.drain_events().into_iter().any(|e| {
        matches!(
            e,
            Event::BufferFlushing { kind: Some(StreamKind::Audio), .. }
        )
    });
    assert!(flushed_audio);

    let resets_before = h.transmux.lock().resets;
    h.scheduler
        .handle_event(Event::AudioTrackSwitching { id: 0, url: None });
    assert!(!h.scheduler.alt_audio);
    assert_eq!(h.transmux.lock().resets, resets_before + 1);
}

// The tokio driver ticks until told to stop.
#[tokio::test(flavor = "multi_thread")]
async fn test_run_ticker_shutdown() {
    let (loader, _) = RecordingLoader::new();
    let (transmuxer, _) = StubTransmuxer::new();
    let scheduler = Arc::new(parking_lot::Mutex::new(
        StreamScheduler::new(StreamConfig::default(), loader, transmuxer).unwrap(),
    ));
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(run_ticker(scheduler.clone(), stop_rx));
    tokio::time::sleep(Duration::from_millis(250)).await;
    stop_tx.send(true).unwrap();
    handle.await.unwrap();
    assert_eq!(scheduler.lock().state(), SchedulerState::Stopped);
}
