mod catalog;
mod cmd;
mod command;
mod filter;
#[cfg(test)]
mod filter_test;
mod gpu;
mod interrupt;
mod log;
#[cfg(test)]
mod mocksystem;
mod publish;
mod realsystem;
mod remote;
mod sched;
mod systemapi;
mod util;

use crate::systemapi::SystemAPI;

use std::path::PathBuf;

const USAGE_ERROR: i32 = 2; // clap, Python, Go

struct Args {
    expfile: String,
    data_dir: String,
    tmp_dir: String,
    dry_run: bool,
    verbose: bool,
    use_skypilot: bool,
    use_slurm: Option<bool>,
}

fn main() {
    log::init();
    let args = command_line();

    let system = realsystem::RealSystem::new();

    // The tri-state slurm flag: on a host with srun the user must choose, and asking for
    // slurm without srun is a configuration error.
    let srun_available = system.srun_available();
    let use_slurm = match args.use_slurm {
        None => {
            if srun_available {
                eprintln!("srun is available. Either pass --use-slurm or --no-use-slurm");
                std::process::exit(USAGE_ERROR);
            }
            false
        }
        Some(true) => {
            if !srun_available {
                eprintln!("srun is not available, cannot use slurm");
                std::process::exit(USAGE_ERROR);
            }
            true
        }
        Some(false) => false,
    };
    if args.use_skypilot {
        println!("WARNING: Using skypilot. Watch usage to avoid excessive bills.");
    }

    let opts = sched::SchedOptions {
        expfile: args.expfile,
        data_dir: PathBuf::from(args.data_dir),
        tmp_dir: PathBuf::from(args.tmp_dir),
        dry_run: args.dry_run,
        verbose: args.verbose,
        use_skypilot: args.use_skypilot,
        use_slurm,
    };
    let mut scheduler = sched::Scheduler::new(&system, opts);
    std::process::exit(scheduler.run());
}

// For the sake of simplicity:
//  - allow repeated options to overwrite earlier values
//  - all error reporting is via a generic "usage" message, without specificity as to what
//    was wrong

fn command_line() -> Args {
    let args = std::env::args().collect::<Vec<String>>();
    let mut expfile = None;
    let mut data_dir = "data".to_string();
    let mut tmp_dir = "data_tmp".to_string();
    let mut dry_run = false;
    let mut verbose = false;
    let mut use_skypilot = false;
    let mut use_slurm = None;
    let mut next = 1;
    while next < args.len() {
        let arg = args[next].as_ref();
        next += 1;
        if let Some(new_next) = bool_arg(arg, &args, next, "--dry-run") {
            (next, dry_run) = (new_next, true);
        } else if let Some(new_next) = bool_arg(arg, &args, next, "--verbose") {
            (next, verbose) = (new_next, true);
        } else if let Some(new_next) = bool_arg(arg, &args, next, "--use-skypilot") {
            (next, use_skypilot) = (new_next, true);
        } else if let Some(new_next) = bool_arg(arg, &args, next, "--use-slurm") {
            (next, use_slurm) = (new_next, Some(true));
        } else if let Some(new_next) = bool_arg(arg, &args, next, "--no-use-slurm") {
            (next, use_slurm) = (new_next, Some(false));
        } else if let Some((new_next, value)) = string_arg(arg, &args, next, "--data-dir")
            .or_else(|| string_arg(arg, &args, next, "-d"))
        {
            (next, data_dir) = (new_next, value);
        } else if let Some((new_next, value)) = string_arg(arg, &args, next, "--tmp-dir")
            .or_else(|| string_arg(arg, &args, next, "-t"))
        {
            (next, tmp_dir) = (new_next, value);
        } else if arg == "help" || arg == "--help" || arg == "-h" {
            usage(false);
        } else if arg.starts_with('-') {
            usage(true);
        } else if expfile.is_none() {
            expfile = Some(arg.to_string());
        } else {
            usage(true);
        }
    }
    Args {
        expfile: expfile.unwrap_or_else(|| "exps.conf".to_string()),
        data_dir,
        tmp_dir,
        dry_run,
        verbose,
        use_skypilot,
        use_slurm,
    }
}

fn bool_arg(arg: &str, _args: &[String], next: usize, opt_name: &str) -> Option<usize> {
    if arg == opt_name {
        Some(next)
    } else {
        None
    }
}

fn string_arg(arg: &str, args: &[String], next: usize, opt_name: &str) -> Option<(usize, String)> {
    if arg == opt_name {
        if next < args.len() {
            Some((next + 1, args[next].to_string()))
        } else {
            None
        }
    } else if let Some((first, rest)) = arg.split_once('=') {
        if first == opt_name {
            Some((next, rest.to_string()))
        } else {
            None
        }
    } else {
        None
    }
}

fn usage(is_error: bool) -> ! {
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    let out: &mut dyn std::io::Write = if is_error { &mut stderr } else { &mut stdout };

    show_version(out);
    let _ = out.write(
        b"
Usage: expsched [OPTIONS] [EXPFILE]

Runs the commands in EXPFILE (default exps.conf) as local child processes,
subject to RAM, core and GPU VRAM budgets, until every declared output file
exists under the data directory.

Options:
  -d, --data-dir directory
      Authoritative location of completed outputs [default: data]
  -t, --tmp-dir directory
      Staging area for in-progress outputs and per-command logs
      [default: data_tmp]
  --dry-run
      Print each command's shell form in launch order and exit without
      launching anything
  --verbose
      Print per-command reasons when a command is not ready to launch
  --use-skypilot
      Submit commands that carry a remote template through the skypilot
      wrapper instead of enforcing local resource budgets for them
  --use-slurm / --no-use-slurm
      Wrap commands in srun / run locally.  On a host where srun exists one
      of the two must be passed explicitly
",
    );
    let _ = out.flush();
    std::process::exit(if is_error { USAGE_ERROR } else { 0 });
}

fn show_version(out: &mut dyn std::io::Write) {
    let _ = out.write(b"expsched version ");
    let _ = out.write(env!("CARGO_PKG_VERSION").as_bytes());
    let _ = out.write(b"\n");
}
