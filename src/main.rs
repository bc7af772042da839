use seqplay::cli::Args;
use seqplay::config::{self, Settings};
use seqplay::core::events::CacheChanged;
use seqplay::core::frame_cache::FrameGuard;
use seqplay::core::player::Direction;
use seqplay::entities::Frame;
use seqplay::{Engine, Session};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const SETTINGS_FILE: &str = "seqplay.json";
const LOG_FILE: &str = "seqplay.log";
const PUMP_TIMEOUT: Duration = Duration::from_millis(100);
const REPORT_EVERY: Duration = Duration::from_secs(1);

/// One simulated viewer: a session and the frame it is currently showing.
struct Viewer {
    session: Session,
    shown: Option<FrameGuard<Frame>>,
}

fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn synthetic_frame(width: usize, height: usize) -> impl Fn(i64) -> Frame {
    move |frame| {
        debug!("Decoding synthetic frame {}", frame);
        Frame::blank(width, height)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {:#}", e);
    }

    init_logging(&args, &path_config)?;

    let settings_path = config::config_file(SETTINGS_FILE, &path_config);
    let mut settings = Settings::load_or_default(&settings_path);
    args.apply_to(&mut settings);
    if args.save_settings {
        settings.save(&settings_path)?;
        info!("Settings saved to {}", settings_path.display());
    }

    let mut engine: Engine<Frame> = Engine::new(settings);

    let notifications = Arc::new(AtomicU64::new(0));
    let evicted = Arc::new(AtomicUsize::new(0));
    {
        let notifications = Arc::clone(&notifications);
        let evicted = Arc::clone(&evicted);
        engine.bus().subscribe::<CacheChanged, _>(move |e| {
            notifications.fetch_add(1, Ordering::Relaxed);
            evicted.fetch_add(e.evicted, Ordering::Relaxed);
        });
    }

    let direction = if args.reverse { Direction::Reverse } else { Direction::Forward };
    let decode = synthetic_frame(args.size.0, args.size.1);
    let mut viewers: Vec<Viewer> = (0..args.sessions.max(1))
        .map(|_| {
            let session = engine.open_session(args.frames);
            {
                let mut clock = session.lock_clock();
                if let Some((start, end)) = args.play_range() {
                    clock.set_range(start, end);
                    clock.set_range_enabled(true);
                }
                clock.play(direction);
            }
            let frame = session.current_frame();
            let shown = Some(session.request_frame(engine.cache(), frame, &decode));
            Viewer { session, shown }
        })
        .collect();

    let run_for = Duration::from_secs_f64(args.duration.max(0.0));
    let started = Instant::now();
    let mut last_report = started;

    while started.elapsed() < run_for {
        if let Some(steps) = engine.hub_mut().pump(PUMP_TIMEOUT) {
            for (clock_id, delta) in steps {
                let Some(viewer) = viewers.iter_mut().find(|v| v.session.clock_id() == clock_id) else {
                    continue;
                };
                // Release the old frame before taking the new one
                viewer.shown = None;
                viewer.shown = Some(viewer.session.request_frame(engine.cache(), delta.frame, &decode));

                let step = delta.delta.signum();
                for ahead in 1..=args.read_ahead {
                    let frame = (delta.frame + step * ahead).rem_euclid(args.frames.max(1));
                    if !engine.cache().contains(viewer.session.owner(), frame) {
                        drop(viewer.session.request_frame(engine.cache(), frame, &decode));
                    }
                }
            }
        }
        // Subscribers already saw the events; keep the queue from growing
        engine.bus().poll();

        if last_report.elapsed() >= REPORT_EVERY {
            last_report = Instant::now();
            for viewer in &viewers {
                let clock = viewer.session.lock_clock();
                info!(
                    "{}: frame {} at {:.2} fps (target {:.2}){}",
                    viewer.session.owner(),
                    clock.frame(),
                    clock.real_speed(),
                    clock.speed(),
                    if clock.dropped_frames() { ", dropping frames" } else { "" }
                );
            }
            let cache = engine.cache();
            info!(
                "Cache: {} entries, {} / {} MB",
                cache.len(),
                cache.used() / 1024 / 1024,
                cache.budget() / 1024 / 1024
            );
        }

        if viewers.iter().all(|v| !v.session.lock_clock().is_playing()) {
            warn!("All sessions stopped, ending early");
            break;
        }
    }

    let final_frames: Vec<(String, i64)> = viewers
        .iter()
        .map(|v| (v.session.owner().to_string(), v.session.current_frame()))
        .collect();
    let ticks = engine.hub().ticks();
    let stats = engine.cache().stats();

    for viewer in viewers.drain(..) {
        drop(viewer.shown);
        engine.close_session(viewer.session);
    }
    engine.cache().purge();

    println!("seqplay: ran {:.2}s, {} ticks", started.elapsed().as_secs_f64(), ticks);
    for (owner, frame) in &final_frames {
        println!("  {} stopped at frame {}", owner, frame);
    }
    println!(
        "  cache: {} hits, {} misses ({:.1}% hit rate), {} evicted, {} notifications",
        stats.hits(),
        stats.misses(),
        stats.hit_rate() * 100.0,
        evicted.load(Ordering::Relaxed),
        notifications.load(Ordering::Relaxed)
    );
    println!(
        "  cache after close: {} entries, {} bytes",
        engine.cache().len(),
        engine.cache().used()
    );
    Ok(())
}
