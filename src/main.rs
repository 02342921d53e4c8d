use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use picast::config::Options;
use picast::engine::{Collaborators, Engine, EngineParams, Sinks};
use picast::hls::{HlsConfig, HlsSegmenter, DEFAULT_NUM_RETAINED_OLD_FILES};
use picast::hooks;
use picast::net::rtsp::RtspSender;
use picast::net::tcp::TcpPusher;
use picast::replay;
use picast::source::{NullAudio, NullCamera, NullSubtitles};
use picast::state::StateDir;

fn main() {
    let options = Options::parse();
    let default_filter = if options.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    log::info!("picast starting");

    if let Err(e) = run(options) {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn run(options: Options) -> Result<(), String> {
    options.validate()?;

    if options.query {
        let json = serde_json::to_string_pretty(&options)
            .map_err(|e| format!("failed to serialize configuration: {e}"))?;
        println!("{json}");
        return Ok(());
    }

    let state = StateDir::open(&options.state_dir)?;
    hooks::prepare_dir(&options.hooks_dir)?;

    let layout = options.stream_layout();
    let hls = match &options.hls_output_dir {
        Some(dir) => Some(HlsSegmenter::new(HlsConfig {
            dir: dir.clone(),
            num_recent_files: options.hls_number_of_segments,
            num_retained_old_files: DEFAULT_NUM_RETAINED_OLD_FILES,
            encryption: options.hls_encryption_settings()?,
            layout,
        })?),
        None => None,
    };
    let tcp = match &options.tcp_output {
        Some(dest) => Some(TcpPusher::connect(dest, layout)?),
        None => None,
    };
    let rtsp = if options.rtsp_out {
        Some(RtspSender::connect(&options.rtsp_config())?)
    } else {
        None
    };

    let engine = Arc::new(Engine::new(
        EngineParams {
            vfr: options.vfr,
            video_fps: options.video_fps,
            audio_fps: options.audio_fps(),
            video_pts_step: options.video_pts_step(),
            audio_pts_step: options.audio_pts_step(),
            record_buffer_keyframes: options.record_buffer_keyframes,
            hls_keyframes_per_segment: options.hls_keyframes_per_segment,
            layout,
            rec_dir: options.rec_dir.clone(),
            rec_tmp_dir: options.rec_tmp_dir.clone(),
            rec_archive_dir: options.rec_archive_dir.clone(),
        },
        state,
        Sinks { hls, tcp, rtsp },
        Collaborators {
            camera: Box::new(NullCamera),
            audio: Box::new(NullAudio),
            subtitles: Box::new(NullSubtitles),
        },
    ));

    let keep_running = Arc::new(AtomicBool::new(true));

    // Capture collaborators are out-of-tree; this build drives the
    // pipeline from replay files.
    let mut source_threads = Vec::new();
    if let Some(path) = &options.video_in {
        source_threads.push(replay::spawn_video_replay(
            engine.clone(),
            path,
            options.video_fps,
            keep_running.clone(),
        )?);
    }
    if let Some(path) = &options.audio_in {
        if options.no_audio {
            log::warn!("--audioin ignored because --noaudio is set");
        } else {
            source_threads.push(replay::spawn_audio_replay(
                engine.clone(),
                path,
                options.audio_sample_rate,
                keep_running.clone(),
            )?);
        }
    }
    if source_threads.is_empty() {
        log::warn!(
            "no packet sources attached; supply --videoin/--audioin or wire \
             capture collaborators (hooks and sinks stay live)"
        );
    }

    let runtime =
        tokio::runtime::Runtime::new().map_err(|e| format!("failed to create tokio runtime: {e}"))?;
    runtime.block_on(async {
        let watcher = tokio::spawn(hooks::watch(
            options.hooks_dir.clone(),
            engine.clone(),
            keep_running.clone(),
        ));

        wait_for_shutdown_signal().await;
        log::info!("shutdown requested");
        keep_running.store(false, Ordering::Relaxed);
        let _ = watcher.await;
    });

    for thread in source_threads {
        let _ = thread.join();
    }
    engine.shutdown();
    log::info!("picast stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
