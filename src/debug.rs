//! `GODEBUG` style debug knobs and `GOGC` parsing.

/// Debug variables recognized in the `GODEBUG` environment variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcDebug {
    /// `1`: one summary line per cycle. `2`: also repeat every cycle as a stop-the-world cycle.
    pub gctrace: i32,
    /// Print pacer state at cycle start and end.
    pub gcpacertrace: i32,
    /// `1`: run cycles with the world stopped. `2`: also sweep synchronously.
    pub gcstoptheworld: i32,
    /// Verify the concurrent mark with a stop-the-world mark during mark termination.
    pub gccheckmark: i32,
    /// Print a trace with a backtrace for every allocation and free.
    pub allocfreetrace: i32,
    /// Treat bad pointers found while marking as fatal. `0` downgrades them to warnings.
    pub invalidptr: i32,
}

impl Default for GcDebug {
    fn default() -> Self {
        Self {
            gctrace: 0,
            gcpacertrace: 0,
            gcstoptheworld: 0,
            gccheckmark: 0,
            allocfreetrace: 0,
            invalidptr: 1,
        }
    }
}

impl GcDebug {
    /// Parses a comma separated `key=value` list. Unknown keys are ignored and malformed values
    /// read as zero.
    pub fn parse(s: &str) -> Self {
        let mut debug = Self::default();
        for item in s.split(',') {
            let mut kv = item.splitn(2, '=');
            let key = kv.next().unwrap_or("").trim();
            let value = kv.next().unwrap_or("").trim().parse::<i32>().unwrap_or(0);
            match key {
                "gctrace" => debug.gctrace = value,
                "gcpacertrace" => debug.gcpacertrace = value,
                "gcstoptheworld" => debug.gcstoptheworld = value,
                "gccheckmark" => debug.gccheckmark = value,
                "allocfreetrace" => debug.allocfreetrace = value,
                "invalidptr" => debug.invalidptr = value,
                _ => {}
            }
        }
        debug
    }

    pub fn from_env() -> Self {
        std::env::var("GODEBUG")
            .map(|s| Self::parse(&s))
            .unwrap_or_default()
    }
}

/// Parses a `GOGC` value: unset means 100, `off` disables collection (-1).
pub fn parse_gogc(value: Option<&str>) -> i32 {
    match value.map(str::trim) {
        None | Some("") => 100,
        Some("off") => -1,
        Some(v) => v.parse().unwrap_or(100),
    }
}
