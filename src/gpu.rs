// GPU probing via nvidia-smi.
//
// We parse the output of `nvidia-smi --list-gpus` and the CSV form of `--query-gpu`.  This
// output is (documented to be) not necessarily stable, but it is what is portably available
// without linking the management library, and the parse failures degrade to "no GPUs" /
// "no free VRAM known", which the scheduler treats as non-fatal.

use crate::command;
use crate::log;

const SMI_TIMEOUT_S: u64 = 10;

const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

// Enumerate the visible GPU devices, as device-index strings.
//
// If CUDA_VISIBLE_DEVICES is set it wins: "-1" means no GPUs, otherwise it must be a
// comma-separated list of integer indices (anything unparseable means no GPUs).  Otherwise
// ask nvidia-smi; if the tool is absent there are no GPUs.
pub fn probe_devices() -> Vec<String> {
    match std::env::var(CUDA_VISIBLE_DEVICES) {
        Ok(v) => devices_from_env(&v),
        Err(_) => match command::safe_command("nvidia-smi", &["--list-gpus"], SMI_TIMEOUT_S) {
            Ok(output) => parse_list_gpus(&output),
            Err(_) => vec![],
        },
    }
}

pub fn devices_from_env(value: &str) -> Vec<String> {
    if value == "-1" {
        return vec![];
    }
    let mut devices = vec![];
    for part in value.split(',') {
        match part.trim().parse::<i64>() {
            Ok(n) => devices.push(n.to_string()),
            Err(_) => return vec![],
        }
    }
    devices
}

// Lines look like "GPU 0: NVIDIA GeForce RTX 3090 (UUID: GPU-...)".
pub fn parse_list_gpus(raw_text: &str) -> Vec<String> {
    let mut devices = vec![];
    for line in raw_text.lines() {
        if let Some(rest) = line.strip_prefix("GPU ") {
            if let Some((index, _)) = rest.split_once(':') {
                if index.parse::<usize>().is_ok() {
                    devices.push(index.to_string());
                }
            }
        }
    }
    devices
}

const VRAM_QUERY_ARGS: &[&str] = &["--query-gpu=gpu_name,index,memory.free", "--format=csv"];

// Query free VRAM in GiB for each of `devices`.  A device we get no reading for stays at
// 0.0 and is reported; the caller treats that as a failed probe for that card, not an
// error.
pub fn probe_free_vram(devices: &[String]) -> Vec<f64> {
    let raw = match command::safe_command("nvidia-smi", VRAM_QUERY_ARGS, SMI_TIMEOUT_S) {
        Ok(output) => output,
        Err(_) => "".to_string(),
    };
    let free = parse_free_vram(&raw, devices);
    for (i, val) in free.iter().enumerate() {
        if *val == 0.0 {
            log::info(&format!(
                "Could not get free memory for GPU {}",
                devices[i]
            ));
        }
    }
    free
}

// The query output is CSV with a header row:
//
//     name, index, memory.free [MiB]
//     NVIDIA GeForce RTX 3090, 0, 23034 MiB
//
// Column order is keyed off the header rather than assumed.  The result vector is aligned
// with `devices`; rows for devices we are not tracking are ignored.
pub fn parse_free_vram(raw_text: &str, devices: &[String]) -> Vec<f64> {
    let mut free_gb = vec![0.0; devices.len()];
    let mut lines = raw_text.lines();
    let header = match lines.next() {
        Some(h) => h,
        None => return free_gb,
    };
    let columns: Vec<&str> = header.split(',').map(|c| c.trim()).collect();
    let name_col = columns.iter().position(|c| *c == "name");
    let index_col = columns.iter().position(|c| *c == "index");
    let free_col = columns.iter().position(|c| c.starts_with("memory.free"));
    let (name_col, index_col, free_col) = match (name_col, index_col, free_col) {
        (Some(n), Some(i), Some(f)) => (n, i, f),
        _ => return free_gb,
    };
    for line in lines {
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        if fields.len() <= name_col.max(index_col).max(free_col) {
            continue;
        }
        let index = fields[index_col];
        if let Some(i) = devices.iter().position(|d| d == index) {
            // "23034 MiB" -> 23034
            let mib = fields[free_col]
                .split_ascii_whitespace()
                .next()
                .and_then(|m| m.parse::<u64>().ok());
            if let Some(mib) = mib {
                log::info(&format!("{}: {} MiB free", fields[name_col], mib));
                free_gb[i] = mib as f64 / 1024.0;
            }
        }
    }
    free_gb
}
