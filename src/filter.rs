use crate::cmd::{cmd_order, Cmd};
use crate::log;

use std::path::Path;

// The filter pipeline: pure set-to-subset functions applied in order by the scheduler to
// find the commands that are ready to run.  Each rejection reason is logged only on
// verbose cycles to keep the steady-state loop quiet.

// Retain a command iff at least one of its declared outputs does not yet exist under the
// data directory.  A command with no outputs at all can never be considered complete; it
// is reported and dropped.
pub fn needs_output(cmds: Vec<Cmd>, data_dir: &Path) -> Vec<Cmd> {
    cmds.into_iter()
        .filter(|c| {
            let outs = c.outputs();
            if outs.is_empty() {
                log::error(&format!("No outputs for command: {}", c.name()));
                return false;
            }
            outs.iter().any(|f| !data_dir.join(f).exists())
        })
        .collect()
}

// Retain a command iff every declared input exists under the data directory.  Inputs are
// never resolved against the staging directory: an output becomes usable as an input only
// once published.
pub fn inputs_ready(cmds: Vec<Cmd>, data_dir: &Path, verbose: bool) -> Vec<Cmd> {
    cmds.into_iter()
        .filter(|c| {
            for f in c.inputs() {
                if !data_dir.join(f).exists() {
                    if verbose {
                        log::verbose(&format!("Waiting on input: {f}"));
                    }
                    return false;
                }
            }
            true
        })
        .collect()
}

pub fn fits_ram(
    cmds: Vec<Cmd>,
    reserved_ram_gb: f64,
    ram_in_use_gb: f64,
    ram_gb_cap: f64,
    use_skypilot: bool,
    verbose: bool,
) -> Vec<Cmd> {
    cmds.into_iter()
        .filter(|c| {
            if use_skypilot && c.remote_template.is_some() {
                true
            } else if reserved_ram_gb.max(ram_in_use_gb) + c.ram_gb <= ram_gb_cap {
                true
            } else {
                if verbose {
                    log::verbose(&format!("Not enough ram free to run: {}", c.name()));
                }
                false
            }
        })
        .collect()
}

// GPU admission:
//  - explicit `gpus`: admissible only when every per-GPU reservation is zero (the string's
//    indices are opaque to us, so such a command gets the machine to itself);
//  - no gpus, gpu_ram_gb = 0: no GPU needed, admissible;
//  - otherwise: admissible iff the best card's free VRAM is >= gpu_ram_gb (with no cards
//    at all the best is taken to be 0).  The assignment cursor always rests on a card
//    with maximal free VRAM, so an admitted command fits on the card it will be given.
pub fn fits_gpu(
    cmds: Vec<Cmd>,
    gpu_ram_reserved: &[f64],
    gpu_ram_cap: &[f64],
    use_skypilot: bool,
    verbose: bool,
) -> Vec<Cmd> {
    let max_free = gpu_ram_cap
        .iter()
        .zip(gpu_ram_reserved.iter())
        .map(|(cap, reserved)| cap - reserved)
        .fold(0.0, f64::max);
    cmds.into_iter()
        .filter(|c| {
            if use_skypilot && c.remote_template.is_some() {
                true
            } else if c.gpus.is_some() {
                if gpu_ram_reserved.iter().all(|r| *r == 0.0) {
                    true
                } else {
                    if verbose {
                        log::verbose(&format!("Not enough gpu ram free to run: {}", c.name()));
                    }
                    false
                }
            } else if max_free >= c.gpu_ram_gb {
                true
            } else {
                if verbose {
                    log::verbose(&format!("Not enough gpu ram free to run: {}", c.name()));
                }
                false
            }
        })
        .collect()
}

pub fn fits_cores(
    cmds: Vec<Cmd>,
    reserved_cores: u32,
    max_core_alloc: u32,
    use_skypilot: bool,
    verbose: bool,
) -> Vec<Cmd> {
    cmds.into_iter()
        .filter(|c| {
            if use_skypilot && c.remote_template.is_some() {
                true
            } else if reserved_cores + c.cores_as_int() <= max_core_alloc {
                true
            } else {
                if verbose {
                    log::verbose(&format!("Not enough cores free to run: {}", c.name()));
                }
                false
            }
        })
        .collect()
}

// Retain a command iff no currently-running process has an equal command.
pub fn not_running(cmds: Vec<Cmd>, running: &[&Cmd]) -> Vec<Cmd> {
    cmds.into_iter()
        .filter(|c| !running.iter().any(|r| *r == c))
        .collect()
}

// Sort into launch order; the sort is stable so commands the ordering does not separate
// keep their catalog order.
pub fn sort_cmds(mut cmds: Vec<Cmd>) -> Vec<Cmd> {
    cmds.sort_by(cmd_order);
    cmds
}
