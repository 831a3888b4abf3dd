//! End-to-end scenarios driving a real engine, pump thread and all,
//! against a scripted core.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::binding::{AvInfo, CoreInfo};
use crate::config::{OpenOptions, PlayerSettings};
use crate::playback::{PlaybackEngine, SPEED_NORMAL, SPEED_PAUSED};
use crate::strategy::GameFile;
use crate::test_utils::{
    LoadRecord, MemoryVfs, RecordingAudio, RecordingInput, RecordingVideo, ScriptedCore,
    ScriptedHandle,
};

struct Fixture {
    engine: PlaybackEngine,
    video: Arc<RecordingVideo>,
    audio: Arc<RecordingAudio>,
    input: Arc<RecordingInput>,
}

fn fixture_with(settings: PlayerSettings, vfs: MemoryVfs) -> Fixture {
    let video = Arc::new(RecordingVideo::default());
    let audio = Arc::new(RecordingAudio::default());
    let input = Arc::new(RecordingInput::default());
    let engine = PlaybackEngine::new(video.clone(), audio.clone(), input.clone(), settings)
        .with_vfs(Arc::new(vfs));
    Fixture {
        engine,
        video,
        audio,
        input,
    }
}

fn fixture() -> Fixture {
    fixture_with(PlayerSettings::default(), MemoryVfs::default())
}

fn snes_like_core() -> ScriptedCore {
    ScriptedCore::new(CoreInfo {
        name: "snes9x-next".to_string(),
        version: "1.52".to_string(),
        valid_extensions: vec![".smc".to_string(), ".sfc".to_string()],
        needs_full_path: true,
        block_extract: false,
    })
}

/// Poll until the scripted core has run at least `frames`, or panic.
fn wait_for_frames(handle: &ScriptedHandle, frames: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while handle.frames_run() < frames {
        assert!(Instant::now() < deadline, "timed out waiting for {frames} frames");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Let any in-flight frame drain after a control change.
fn settle() {
    std::thread::sleep(Duration::from_millis(100));
}

#[test]
fn test_normal_open_aligns_rates_and_uses_hd_path() {
    let fx = fixture();
    let mut core = snes_like_core();
    core.set_av_info(AvInfo {
        base_width: 256,
        base_height: 224,
        max_width: 512,
        max_height: 448,
        aspect_ratio: 0.0,
        fps: 60.0988,
        sample_rate: 32040.5,
    });
    // This core does not serialize: rewind is unavailable.
    core.set_state_len(0);
    let handle = core.handle();

    let file = GameFile::local("/games/mario.smc");
    assert!(fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default()));

    // A full-path core on a local file: the raw path, nothing else tried.
    assert_eq!(
        handle.load_log(),
        vec![LoadRecord::Path(PathBuf::from("/games/mario.smc"))]
    );

    // Audio clocks the system: 32040.5 Hz snaps to 32040 and the
    // framerate scales by the same ratio.
    let expected_fps = 60.0988 * 32040.0 / 32040.5;
    wait_for_frames(&handle, 1);
    let started = fx.video.started_fps.lock().unwrap().clone();
    assert_eq!(started.len(), 1);
    assert!((started[0] - expected_fps).abs() < 1e-9);
    assert_eq!(*fx.audio.started_rate.lock().unwrap(), Some(32040));

    // Port 0 gets a joypad by default.
    assert_eq!(handle.ports(), vec![(0, crate::abi::DEVICE_JOYPAD)]);

    // No serialization means no rewind window.
    assert_eq!(fx.engine.total_time_ms(), 0);
    assert_eq!(fx.engine.current_time_ms(), 0);
    assert_eq!(fx.engine.current_percent(), 0.0);

    assert!(fx.engine.close());
}

#[test]
fn test_rewind_window_time_reporting() {
    let fx = fixture();
    let core = snes_like_core(); // 60 fps, 48 kHz, 64 byte state
    let handle = core.handle();
    let file = GameFile::local("/games/mario.smc");
    assert!(fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default()));

    // 60 fps gives a 3600 frame window: exactly one minute.
    assert_eq!(fx.engine.total_time_ms(), 60_000);

    fx.engine.set_speed(50_000);
    wait_for_frames(&handle, 120);
    fx.engine.pause();
    settle();

    // Position tracks captured frames (all still inside the window).
    assert!(handle.frames_run() < 3600);
    let expected = 1000 * u64::from(handle.frames_run()) / 60;
    assert_eq!(fx.engine.current_time_ms(), expected);
    assert!(fx.engine.current_percent() > 0.0);

    fx.engine.close();
}

#[test]
fn test_large_seek_rewinds_to_the_start() {
    let fx = fixture();
    let core = snes_like_core(); // 60 fps: a large seek is 600 frames
    let handle = core.handle();
    let file = GameFile::local("/games/mario.smc");
    assert!(fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default()));

    fx.engine.set_speed(50_000);
    wait_for_frames(&handle, 600);
    fx.engine.pause();
    settle();

    let frames_before = handle.frames_run();
    // Everything must still be inside the one-minute window for the seek
    // arithmetic below to be exact.
    assert!(frames_before < 3600);
    let expected_after = frames_before - 600;

    fx.engine.seek_backward(true);
    assert_eq!(handle.frames_run(), expected_after);

    // A zero-percent seek drains the remaining window back to frame 0.
    fx.engine.seek_to_percent(0.0);
    assert_eq!(handle.frames_run(), 0);
    assert_eq!(fx.engine.current_time_ms(), 0);

    fx.engine.close();
}

#[test]
fn test_fast_forward_mutes_audio_and_normal_speed_resumes() {
    let fx = fixture();
    let core = snes_like_core();
    let handle = core.handle();
    let file = GameFile::local("/games/mario.smc");
    assert!(fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default()));

    wait_for_frames(&handle, 3);
    assert!(fx.audio.batches.load(Ordering::SeqCst) > 0);

    fx.engine.set_speed(2000);
    settle();
    let muted_at = fx.audio.batches.load(Ordering::SeqCst);
    let frames_at = handle.frames_run();
    wait_for_frames(&handle, frames_at + 20);
    assert_eq!(fx.audio.batches.load(Ordering::SeqCst), muted_at);

    fx.engine.set_speed(SPEED_NORMAL);
    let resumed_at = fx.audio.batches.load(Ordering::SeqCst);
    let frames_at = handle.frames_run();
    wait_for_frames(&handle, frames_at + 3);
    settle();
    assert!(fx.audio.batches.load(Ordering::SeqCst) > resumed_at);

    fx.engine.close();
}

#[test]
fn test_pause_is_a_toggle() {
    let fx = fixture();
    let core = snes_like_core();
    let handle = core.handle();
    let file = GameFile::local("/games/mario.smc");
    assert!(fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default()));
    wait_for_frames(&handle, 1);

    fx.engine.pause();
    assert_eq!(fx.engine.speed(), SPEED_PAUSED);
    settle();
    let frozen = handle.frames_run();
    settle();
    assert_eq!(handle.frames_run(), frozen);

    // Second toggle: back to running.
    fx.engine.pause();
    assert_eq!(fx.engine.speed(), SPEED_NORMAL);
    wait_for_frames(&handle, frozen + 2);

    // Third: paused again.
    fx.engine.pause();
    assert_eq!(fx.engine.speed(), SPEED_PAUSED);

    fx.engine.close();
}

#[test]
fn test_zip_that_lies_falls_back_to_in_memory() {
    let mut vfs = MemoryVfs::default();
    vfs.insert_archive("/roms/pack.zip", &[("game.nes", b"nes-rom-data".as_slice())]);
    let settings = PlayerSettings {
        allow_zip: true,
        ..Default::default()
    };
    let fx = fixture_with(settings, vfs);

    let mut core = ScriptedCore::new(CoreInfo {
        name: "fceu".to_string(),
        version: "0.98".to_string(),
        valid_extensions: vec![".nes".to_string(), ".zip".to_string()],
        needs_full_path: false,
        block_extract: true,
    });
    // The core claims zip support but chokes on the archive path.
    core.refuse_next_loads(1);
    let handle = core.handle();

    let file = GameFile::ArchiveMember {
        archive: PathBuf::from("/roms/pack.zip"),
        inner: "game.nes".to_string(),
    };
    assert!(fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default()));

    assert_eq!(
        handle.load_log(),
        vec![
            LoadRecord::Path(PathBuf::from("/roms/pack.zip")),
            LoadRecord::Buffer(b"nes-rom-data".len()),
        ]
    );

    fx.engine.close();
}

#[test]
fn test_shutdown_request_is_surfaced_but_playback_continues() {
    let fx = fixture();
    let stop_flag = Arc::new(AtomicBool::new(false));
    let hook_flag = stop_flag.clone();
    fx.engine
        .set_stop_request_hook(Box::new(move || hook_flag.store(true, Ordering::SeqCst)));

    let mut core = snes_like_core();
    core.shutdown_at_frame(5, fx.engine.environment().clone());
    let handle = core.handle();
    let file = GameFile::local("/games/mario.smc");
    assert!(fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default()));

    wait_for_frames(&handle, 6);
    assert!(stop_flag.load(Ordering::SeqCst));
    assert!(fx.engine.stop_requested());

    // The engine keeps pumping until the application closes it.
    assert!(fx.engine.is_open());
    let now = handle.frames_run();
    wait_for_frames(&handle, now + 5);

    fx.engine.close();
    assert!(!fx.engine.is_open());
}

#[test]
fn test_open_while_open_closes_the_first_session() {
    let fx = fixture();
    let first = snes_like_core();
    let first_handle = first.handle();
    let file = GameFile::local("/games/mario.smc");
    assert!(fx.engine.open_with_core(Box::new(first), &file, &OpenOptions::default()));
    wait_for_frames(&first_handle, 1);

    let second = snes_like_core();
    let second_handle = second.handle();
    assert!(fx.engine.open_with_core(Box::new(second), &file, &OpenOptions::default()));

    // The first pump stopped its sinks; the second started them again.
    assert!(fx.video.stops.load(Ordering::SeqCst) >= 1);
    assert!(fx.input.finishes.load(Ordering::SeqCst) >= 1);
    wait_for_frames(&second_handle, 1);
    assert_eq!(fx.video.started_fps.lock().unwrap().len(), 2);
    assert!(fx.engine.is_open());

    assert!(fx.engine.close());
    assert_eq!(fx.input.finishes.load(Ordering::SeqCst), 2);
    // Closing again is a no-op.
    assert!(fx.engine.close());
    assert_eq!(fx.video.stops.load(Ordering::SeqCst), 2);
}

#[test]
fn test_framerate_bounds_gate_open() {
    for (fps, expect_open) in [(4.9, false), (5.0, true), (100.0, true), (100.1, false)] {
        let fx = fixture();
        let mut core = snes_like_core();
        let mut av = core.av();
        av.fps = fps;
        core.set_av_info(av);

        let file = GameFile::local("/games/mario.smc");
        let opened = fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default());
        assert_eq!(opened, expect_open, "fps {fps}");
        assert_eq!(fx.engine.is_open(), expect_open);
        fx.engine.close();
    }
}

#[test]
fn test_out_of_range_sample_rate_disables_audio_only() {
    for sample_rate in [0.0, 400_000.0] {
        let fx = fixture();
        let mut core = snes_like_core();
        let mut av = core.av();
        av.sample_rate = sample_rate;
        core.set_av_info(av);
        let handle = core.handle();

        let file = GameFile::local("/games/mario.smc");
        assert!(fx.engine.open_with_core(Box::new(core), &file, &OpenOptions::default()));
        wait_for_frames(&handle, 2);

        assert_eq!(*fx.audio.started_rate.lock().unwrap(), None);
        assert_eq!(fx.audio.batches.load(Ordering::SeqCst), 0);
        // Video is unaffected.
        assert!(fx.video.frames.load(Ordering::SeqCst) > 0);

        fx.engine.close();
    }
}

#[test]
fn test_fullscreen_option_reaches_the_video_sink() {
    let fx = fixture();
    let core = snes_like_core();
    let handle = core.handle();
    let file = GameFile::local("/games/mario.smc");
    let options = OpenOptions { fullscreen: true };
    assert!(fx.engine.open_with_core(Box::new(core), &file, &options));
    wait_for_frames(&handle, 1);

    assert_eq!(*fx.video.fullscreen.lock().unwrap(), Some(true));
    // The contract default pixel format was announced before the core
    // could negotiate anything else.
    assert_eq!(
        fx.video.pixel_formats.lock().unwrap().first(),
        Some(&crate::abi::PixelFormat::Xrgb1555)
    );

    fx.engine.close();
}
