use crate::gpu;
use crate::interrupt;
use crate::systemapi;
use crate::util;

use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::time::Instant;

use lazy_static::lazy_static;
use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};

const KIB_PER_GIB: f64 = (1024 * 1024) as f64;

lazy_static! {
    // We're assuming these never change while the system is running.
    static ref CLK_TCK: usize = unsafe { libc::sysconf(libc::_SC_CLK_TCK) as usize };
    static ref CPU_COUNT: usize =
        unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN).max(1) as usize };
}

pub struct RealSystem {
    start: Instant,
}

impl RealSystem {
    pub fn new() -> RealSystem {
        RealSystem {
            start: Instant::now(),
        }
    }
}

impl systemapi::SystemAPI for RealSystem {
    fn compute_now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn sleep(&self, seconds: f64) {
        std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
    }

    fn get_cpu_count(&self) -> usize {
        *CPU_COUNT
    }

    fn compute_memory(&self) -> Result<systemapi::Memory, String> {
        let s = match fs::read_to_string(Path::new("/proc/meminfo")) {
            Ok(s) => s,
            Err(_) => return Err("Could not open or read /proc/meminfo".to_string()),
        };
        let mut total_kib = 0u64;
        let mut available_kib = 0u64;
        for l in s.lines() {
            if l.starts_with("MemTotal: ") {
                total_kib = parse_meminfo_kib(l, &s)?;
            } else if l.starts_with("MemAvailable: ") {
                available_kib = parse_meminfo_kib(l, &s)?;
            }
        }
        if total_kib == 0 {
            return Err(format!("Could not find MemTotal in /proc/meminfo: {s}"));
        }
        Ok(systemapi::Memory {
            total_gib: total_kib as f64 / KIB_PER_GIB,
            available_gib: available_kib as f64 / KIB_PER_GIB,
        })
    }

    fn compute_process_memory_gib(&self, pid: u32) -> Option<f64> {
        // smaps_rollup has the pre-summed figures; it is unreadable once the process is
        // gone, which the caller treats as "skip this process".
        let s = fs::read_to_string(format!("/proc/{pid}/smaps_rollup")).ok()?;
        let mut pss_kib: Option<u64> = None;
        let mut uss_kib = 0u64;
        for l in s.lines() {
            if let Some(rest) = l.strip_prefix("Pss:") {
                pss_kib = parse_kb_line(rest);
            } else if let Some(rest) = l.strip_prefix("Private_Clean:") {
                uss_kib += parse_kb_line(rest).unwrap_or(0);
            } else if let Some(rest) = l.strip_prefix("Private_Dirty:") {
                uss_kib += parse_kb_line(rest).unwrap_or(0);
            }
        }
        let total_kib = pss_kib.unwrap_or(0) + uss_kib;
        Some(total_kib as f64 / KIB_PER_GIB)
    }

    fn compute_process_cpu_secs(&self, pid: u32) -> Option<f64> {
        let line = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        let ticks = stat_cpu_ticks(&line)?;
        Some(ticks as f64 / (*CLK_TCK).max(1) as f64)
    }

    fn compute_gpu_devices(&self) -> Vec<String> {
        gpu::probe_devices()
    }

    fn compute_gpu_free_vram_gib(&self, devices: &[String]) -> Vec<f64> {
        gpu::probe_free_vram(devices)
    }

    fn spawn(
        &self,
        argv: &[String],
        env: &[(String, String)],
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<Box<dyn systemapi::ChildHandle>, String> {
        let stdout = open_append(stdout_path)?;
        let stderr = open_append(stderr_path)?;
        let env_os: Vec<(OsString, OsString)> = env
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect();
        let popen = Popen::create(
            argv,
            PopenConfig {
                stdout: Redirection::File(stdout),
                stderr: Redirection::File(stderr),
                env: Some(env_os),
                ..Default::default()
            },
        )
        .map_err(|e| format!("Could not start {}: {e}", argv[0]))?;
        Ok(Box::new(RealChild { popen }))
    }

    fn srun_available(&self) -> bool {
        util::which("srun")
    }

    fn handle_interruptions(&self) {
        interrupt::handle_interruptions();
    }

    fn is_interrupted(&self) -> bool {
        interrupt::is_interrupted()
    }
}

fn open_append(p: &Path) -> Result<fs::File, String> {
    fs::File::options()
        .create(true)
        .append(true)
        .open(p)
        .map_err(|_| format!("Unable to open {}", p.display()))
}

// We expect "MemTotal:\s+(\d+)\s+kB", roughly.
fn parse_meminfo_kib(l: &str, s: &str) -> Result<u64, String> {
    let fields = l.split_ascii_whitespace().collect::<Vec<&str>>();
    if fields.len() != 3 || fields[2] != "kB" {
        return Err(format!("Unexpected field in /proc/meminfo: {s}"));
    }
    fields[1]
        .parse::<u64>()
        .map_err(|_| format!("Failed to parse field in /proc/meminfo: {s}"))
}

// The tail of a smaps_rollup line: "             1234 kB".
fn parse_kb_line(rest: &str) -> Option<u64> {
    rest.split_ascii_whitespace().next()?.parse::<u64>().ok()
}

// Total CPU ticks (utime + stime + cutime + cstime) from a /proc/<pid>/stat line.  The
// comm field must be skipped first, as the contents up to the last ')' in the line; comm
// itself may contain spaces and parens.  With ")" at index 0 and the state at index 1,
// utime, stime, cutime, cstime are fields 12..16.
fn stat_cpu_ticks(line: &str) -> Option<u64> {
    let commend = line.rfind(')')?;
    let fields: Vec<&str> = line[commend..].split_ascii_whitespace().collect();
    if fields.len() < 16 {
        return None;
    }
    let mut ticks = 0u64;
    for f in &fields[12..16] {
        ticks += f.parse::<u64>().ok()?;
    }
    Some(ticks)
}

struct RealChild {
    popen: Popen,
}

impl systemapi::ChildHandle for RealChild {
    fn pid(&self) -> u32 {
        self.popen.pid().unwrap_or(0)
    }

    fn poll(&mut self) -> Option<i32> {
        match self.popen.poll() {
            None => None,
            Some(ExitStatus::Exited(code)) => Some(code as i32),
            Some(ExitStatus::Signaled(sig)) => Some(-(sig as i32)),
            Some(ExitStatus::Other(code)) => Some(code),
            Some(ExitStatus::Undetermined) => Some(-1),
        }
    }

    fn terminate(&mut self) {
        let _ = self.popen.terminate();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::systemapi::SystemAPI;

    #[test]
    fn test_memory() {
        let system = RealSystem::new();
        let mem = system.compute_memory().unwrap();
        assert!(mem.total_gib > 0.0);
        assert!(mem.available_gib > 0.0);
        assert!(mem.available_gib <= mem.total_gib);
    }

    #[test]
    fn test_stat_cpu_ticks() {
        // comm may contain spaces and parens; utime=50 stime=30 cutime=10 cstime=5.
        // The priority field (20, right after cstime) must not leak into the sum.
        let line =
            "1234 ((a b) c) S 1 1234 1234 0 -1 4194304 100 200 1 2 50 30 10 5 20 0 1 0 300 0 0";
        assert!(stat_cpu_ticks(line) == Some(95));
        // Truncated line
        assert!(stat_cpu_ticks("1234 (short) R 1").is_none());
    }

    #[test]
    fn test_own_process_cpu() {
        let system = RealSystem::new();
        // Our own pid always has a stat file
        let secs = system.compute_process_cpu_secs(std::process::id());
        assert!(secs.is_some());
        // A pid that cannot exist
        assert!(system.compute_process_cpu_secs(u32::MAX).is_none());
    }

    #[test]
    fn test_spawn_and_poll() {
        let system = RealSystem::new();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("stdout.txt");
        let err = dir.path().join("stderr.txt");
        let env: Vec<(String, String)> = std::env::vars().collect();
        let mut child = system
            .spawn(
                &["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
                &env,
                &out,
                &err,
            )
            .unwrap();
        let mut code = None;
        for _ in 0..100 {
            code = child.poll();
            if code.is_some() {
                break;
            }
            system.sleep(0.05);
        }
        assert!(code == Some(0));
        assert!(fs::read_to_string(&out).unwrap() == "hi\n");
    }
}
