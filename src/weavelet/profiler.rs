//! Profile collection inside the weavelet process.
//!
//! Profiles are plain text built from the kernel's per-process accounting:
//! a heap profile is a snapshot of the memory counters, a CPU profile is a
//! series of user/system time samples taken over the requested window.
//! Collection problems are reported in `ProfileReply::errors`, never as a
//! failed call.

use crate::control::messages::{ProfileReply, ProfileRequest, ProfileType};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Interval between CPU samples
pub const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Collect the requested profile, blocking for the CPU window if any.
pub fn collect(req: &ProfileRequest) -> ProfileReply {
    let result = match req.kind {
        ProfileType::Heap => heap_profile(),
        ProfileType::Cpu => cpu_profile(req.cpu_duration),
    };
    match result {
        Ok(data) => ProfileReply {
            data,
            errors: Vec::new(),
        },
        Err(e) => ProfileReply {
            data: Vec::new(),
            errors: vec![e],
        },
    }
}

fn heap_profile() -> Result<Vec<u8>, String> {
    let status = read_proc("status")?;
    let mut out = format!("# heap profile pid={}\n", std::process::id());
    for line in status.lines() {
        if line.starts_with("Vm") || line.starts_with("Rss") {
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out.into_bytes())
}

fn cpu_profile(duration: Duration) -> Result<Vec<u8>, String> {
    if duration.is_zero() {
        return Err("cpu profile duration must be positive".to_string());
    }
    // Fail fast on platforms without per-process accounting.
    let first = cpu_times()?;

    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    let mut out = format!(
        "# cpu profile pid={} duration_ms={} clk_tck={}\n# elapsed_ms utime_ticks stime_ticks\n",
        std::process::id(),
        duration.as_millis(),
        ticks
    );
    let start = Instant::now();
    let _ = writeln!(out, "0 {} {}", first.0, first.1);
    loop {
        let elapsed = start.elapsed();
        if elapsed >= duration {
            break;
        }
        std::thread::sleep(CPU_SAMPLE_INTERVAL.min(duration - elapsed));
        let (utime, stime) = cpu_times()?;
        let _ = writeln!(out, "{} {} {}", start.elapsed().as_millis(), utime, stime);
    }
    Ok(out.into_bytes())
}

fn cpu_times() -> Result<(u64, u64), String> {
    parse_stat_times(&read_proc("stat")?)
}

/// Extract (utime, stime) from a /proc/<pid>/stat line.
fn parse_stat_times(stat: &str) -> Result<(u64, u64), String> {
    // The command name is parenthesized and may itself contain spaces.
    let rest = stat
        .rfind(')')
        .map(|i| &stat[i + 1..])
        .ok_or_else(|| "malformed stat: no command name".to_string())?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is the state (field 3); utime and stime are fields 14 and 15.
    let field = |idx: usize| -> Result<u64, String> {
        fields
            .get(idx)
            .ok_or_else(|| format!("malformed stat: missing field {}", idx + 3))?
            .parse::<u64>()
            .map_err(|e| format!("malformed stat field {}: {}", idx + 3, e))
    };
    Ok((field(11)?, field(12)?))
}

#[cfg(target_os = "linux")]
fn read_proc(name: &str) -> Result<String, String> {
    let path = format!("/proc/self/{}", name);
    std::fs::read_to_string(&path).map_err(|e| format!("reading {}: {}", path, e))
}

#[cfg(not(target_os = "linux"))]
fn read_proc(_name: &str) -> Result<String, String> {
    Err("profiling is not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_with_spaces_in_command() {
        let stat = "4242 (my weird (cmd)) S 1 4242 4242 0 -1 4194560 100 0 0 0 37 12 0 0 20 0 1 0 100";
        assert_eq!(parse_stat_times(stat), Ok((37, 12)));
    }

    #[test]
    fn short_stat_is_an_error() {
        assert!(parse_stat_times("1 (x) S 1 2").is_err());
        assert!(parse_stat_times("no parens here").is_err());
    }

    #[test]
    fn zero_duration_cpu_profile_reports_error() {
        let reply = collect(&ProfileRequest::cpu(Duration::ZERO));
        assert!(reply.data.is_empty());
        assert_eq!(reply.errors.len(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn heap_profile_has_memory_counters() {
        let reply = collect(&ProfileRequest::heap());
        assert!(reply.errors.is_empty(), "{:?}", reply.errors);
        let text = String::from_utf8(reply.data).unwrap();
        assert!(text.starts_with("# heap profile"));
        assert!(text.contains("VmRSS"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cpu_profile_samples_for_the_window() {
        let started = Instant::now();
        let reply = collect(&ProfileRequest::cpu(Duration::from_millis(100)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(reply.errors.is_empty(), "{:?}", reply.errors);
        let text = String::from_utf8(reply.data).unwrap();
        let samples = text.lines().filter(|l| !l.starts_with('#')).count();
        assert!(samples >= 2, "expected several samples, got {}", samples);
    }
}
