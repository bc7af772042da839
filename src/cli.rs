use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::config::Settings;
use crate::core::frame_cache::CachePolicy;
use crate::core::player::LoopMode;
use crate::core::timer_hub::TickStrategy;

// Build version with target info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LoopArg {
    Once,
    Repeat,
    Pingpong,
}

impl From<LoopArg> for LoopMode {
    fn from(arg: LoopArg) -> Self {
        match arg {
            LoopArg::Once => LoopMode::Once,
            LoopArg::Repeat => LoopMode::Repeat,
            LoopArg::Pingpong => LoopMode::PingPong,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Lru,
    Playback,
}

impl From<PolicyArg> for CachePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Lru => CachePolicy::Lru,
            PolicyArg::Playback => CachePolicy::LruPlayback,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TickerArg {
    Busy,
    Fixed,
}

impl From<TickerArg> for TickStrategy {
    fn from(arg: TickerArg) -> Self {
        match arg {
            TickerArg::Busy => TickStrategy::BusyWait,
            TickerArg::Fixed => TickStrategy::FixedRate,
        }
    }
}

/// Headless frame cache and playback clock simulator
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Sequence length in frames
    #[arg(short = 'n', long = "frames", value_name = "N", default_value_t = 240)]
    pub frames: i64,

    /// Playback speed in frames per second (default: from settings)
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<f64>,

    /// Play range start frame
    #[arg(long = "start", value_name = "N")]
    pub range_start: Option<i64>,

    /// Play range end frame
    #[arg(long = "end", value_name = "N")]
    pub range_end: Option<i64>,

    /// Play range (shorthand for --start and --end)
    #[arg(long = "range", value_names = ["START", "END"], num_args = 2)]
    pub range: Option<Vec<i64>>,

    /// Loop mode at the end of the sequence or range
    #[arg(short = 'o', long = "loop", value_enum)]
    pub loop_mode: Option<LoopArg>,

    /// Advance exactly one frame per productive tick
    #[arg(long = "lockstep")]
    pub lockstep: bool,

    /// Play backwards
    #[arg(short = 'r', long = "reverse")]
    pub reverse: bool,

    /// Cache budget in MB (0 = derive from system memory)
    #[arg(short = 'b', long = "budget", value_name = "MB")]
    pub budget_mb: Option<u64>,

    /// Cache eviction policy
    #[arg(long = "policy", value_enum)]
    pub policy: Option<PolicyArg>,

    /// Tick source
    #[arg(long = "ticker", value_enum)]
    pub ticker: Option<TickerArg>,

    /// Tick resolution in milliseconds
    #[arg(long = "resolution", value_name = "MS")]
    pub resolution_ms: Option<u64>,

    /// Number of concurrent playback sessions
    #[arg(short = 's', long = "sessions", value_name = "N", default_value_t = 1)]
    pub sessions: usize,

    /// Simulation run time in seconds
    #[arg(short = 'd', long = "duration", value_name = "SECS", default_value_t = 5.0)]
    pub duration: f64,

    /// Frames requested ahead of the playhead on every step
    #[arg(long = "read-ahead", value_name = "N", default_value_t = 0)]
    pub read_ahead: i64,

    /// Synthetic frame size as WIDTHxHEIGHT
    #[arg(long = "size", value_name = "WxH", default_value = "1920x1080", value_parser = parse_size)]
    pub size: (usize, usize),

    /// Write the effective settings back to the config file
    #[arg(long = "save-settings")]
    pub save_settings: bool,

    /// Enable debug logging to file (default: seqplay.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: Option<PathBuf>,
}

impl Args {
    /// Effective in/out points; `--range` wins over `--start`/`--end`.
    pub fn play_range(&self) -> Option<(i64, i64)> {
        if let Some(range) = &self.range
            && let [start, end] = range.as_slice()
        {
            return Some((*start, *end));
        }
        match (self.range_start, self.range_end) {
            (None, None) => None,
            (start, end) => Some((start.unwrap_or(0), end.unwrap_or(self.frames - 1))),
        }
    }

    /// Overlay command-line overrides on loaded settings.
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(fps) = self.fps {
            settings.fps_base = fps;
        }
        if let Some(mode) = self.loop_mode {
            settings.loop_mode = mode.into();
        }
        if self.lockstep {
            settings.lockstep = true;
        }
        if let Some(mb) = self.budget_mb {
            settings.cache_budget_mb = mb;
        }
        if let Some(policy) = self.policy {
            settings.cache_policy = policy.into();
        }
        if let Some(ticker) = self.ticker {
            settings.tick_strategy = ticker.into();
        }
        if let Some(ms) = self.resolution_ms {
            settings.tick_resolution_ms = ms;
        }
    }
}

fn parse_size(s: &str) -> Result<(usize, usize), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    let w: usize = w.trim().parse().map_err(|e| format!("bad width '{}': {}", w, e))?;
    let h: usize = h.trim().parse().map_err(|e| format!("bad height '{}': {}", h, e))?;
    if w == 0 || h == 0 {
        return Err("size must be non-zero".into());
    }
    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("seqplay").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.frames, 240);
        assert_eq!(args.sessions, 1);
        assert_eq!(args.size, (1920, 1080));
        assert_eq!(args.play_range(), None);
        assert!(args.log_file.is_none());
    }

    #[test]
    fn test_range_shorthand_wins() {
        let args = parse(&["--start", "1", "--range", "10", "20"]);
        assert_eq!(args.play_range(), Some((10, 20)));
        let args = parse(&["-n", "50", "--start", "5"]);
        assert_eq!(args.play_range(), Some((5, 49)));
    }

    #[test]
    fn test_overrides_applied() {
        let args = parse(&["--fps", "30", "--loop", "pingpong", "--policy", "lru", "--ticker", "fixed", "-b", "256"]);
        let mut settings = Settings::default();
        args.apply_to(&mut settings);
        assert_eq!(settings.fps_base, 30.0);
        assert_eq!(settings.loop_mode, LoopMode::PingPong);
        assert_eq!(settings.cache_policy, CachePolicy::Lru);
        assert_eq!(settings.tick_strategy, TickStrategy::FixedRate);
        assert_eq!(settings.cache_budget_mb, 256);
    }

    #[test]
    fn test_log_flag_optional_value() {
        assert_eq!(parse(&["--log"]).log_file, Some(None));
        assert_eq!(parse(&["-l", "x.log"]).log_file, Some(Some(PathBuf::from("x.log"))));
        assert_eq!(parse(&["-vvv"]).verbosity, 3);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480"), Ok((640, 480)));
        assert!(parse_size("640").is_err());
        assert!(parse_size("0x10").is_err());
    }
}
