use crate::catalog;
use crate::cmd::Cmd;
use crate::filter;
use crate::log;
use crate::publish;
use crate::remote;
use crate::systemapi::{ChildHandle, SystemAPI};
use crate::util;

use std::fs;
use std::path::PathBuf;

// The scheduler loop.  Single-threaded and cooperative: this is the only thread that
// mutates scheduler state, concurrency comes from the child OS processes, which are polled
// without blocking.  The filesystem is the source of truth for progress; the ready set is
// recomputed from it every cycle, never precomputed as a dependency graph.

// Seconds to sleep on a cycle that saw no completion, so we don't hard-loop.
const IDLE_SLEEP_S: f64 = 0.2;

// Share of total host RAM the scheduler will commit, in percent.  Strictly enforced by the
// OOM guard even though per-command figures are only advisory.
const VM_PERCENT_CAP: f64 = 90.0;

pub struct SchedOptions {
    pub expfile: String,
    pub data_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub dry_run: bool,
    pub verbose: bool,
    pub use_skypilot: bool,
    pub use_slurm: bool,
}

// One supervised child.  max_ram_gb starts at the command's declared ram_gb and is raised
// by the OOM guard when observed use exceeds it, keeping the RAM reservation total honest.
pub struct RunningProcess {
    pub cmd: Cmd,
    pub child: Box<dyn ChildHandle>,
    pub cuda_devices: Vec<usize>,
    pub max_ram_gb: f64,
}

pub struct Scheduler<'a> {
    system: &'a dyn SystemAPI,
    opts: SchedOptions,
    pub(crate) commands: Vec<Cmd>,
    pub(crate) running: Vec<RunningProcess>,
    pub(crate) reserved_ram_gb: f64,
    pub(crate) reserved_cores: u32,
    pub(crate) warmup_deadline: f64,
    pub(crate) max_concurrent_jobs: usize,
    pub(crate) max_core_alloc: u32,
    pub(crate) cuda_devices: Vec<String>,
    pub(crate) gpu_ram_cap: Vec<f64>,
    pub(crate) gpu_ram_reserved: Vec<f64>,
    pub(crate) next_gpu: usize,
    last_remaining: i64,
    verbose_now: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(system: &'a dyn SystemAPI, opts: SchedOptions) -> Scheduler<'a> {
        let cpus = system.get_cpu_count();
        let mut sched = Scheduler {
            system,
            opts,
            commands: vec![],
            running: vec![],
            reserved_ram_gb: 0.0,
            reserved_cores: 0,
            warmup_deadline: system.compute_now(),
            max_concurrent_jobs: cpus,
            max_core_alloc: cpus as u32,
            cuda_devices: vec![],
            gpu_ram_cap: vec![],
            gpu_ram_reserved: vec![],
            next_gpu: 0,
            last_remaining: -1,
            verbose_now: false,
        };
        if !sched.opts.use_slurm {
            sched.cuda_devices = system.compute_gpu_devices();
            println!("Using GPUS: {}", sched.cuda_devices.join(","));
            sched.gpu_ram_cap = system.compute_gpu_free_vram_gib(&sched.cuda_devices);
            sched.gpu_ram_reserved = vec![0.0; sched.gpu_ram_cap.len()];
        }
        sched
    }

    // Drive cycles until every command reports its outputs complete and nothing is
    // running.  Returns the process exit code.
    pub fn run(&mut self) -> i32 {
        self.system.handle_interruptions();
        loop {
            if self.system.is_interrupted() {
                // Children are left to be adopted by the OS.
                log::info("Interrupted, exiting");
                return 1;
            }
            if self.cycle() {
                return 0;
            }
        }
    }

    // One scheduler cycle.  Returns true when all work is done.
    pub fn cycle(&mut self) -> bool {
        match catalog::load(&self.opts.expfile) {
            Ok(cmds) => self.commands = cmds,
            Err(e) => {
                // Keep the previous catalog so a half-saved edit doesn't wedge us.
                log::error(&format!("Error in {}: {}", self.opts.expfile, e.render()));
            }
        }

        if self.opts.dry_run {
            for c in filter::sort_cmds(self.commands.clone()) {
                println!("{}", c.shell_form(&self.opts.data_dir, &self.opts.tmp_dir));
            }
            return true;
        }

        let (ready, mut done) = self.filter_commands();
        if self.admissible() && !ready.is_empty() {
            self.launch(&ready[0]);
            done = false;
        }

        if !self.opts.use_slurm {
            self.terminate_if_oom();
        }

        let completed = self.collect_completed();
        if !self.running.is_empty() {
            done = false;
        }
        if completed.is_empty() {
            self.system.sleep(IDLE_SLEEP_S);
        }
        self.process_completed(completed);
        done
    }

    // Reduce the catalog to the commands ready to launch, in launch order.  The second
    // return value is true when no command needs output anymore.
    fn filter_commands(&mut self) -> (Vec<Cmd>, bool) {
        let needs = filter::needs_output(self.commands.clone(), &self.opts.data_dir);
        let done = needs.is_empty();

        if needs.len() as i64 != self.last_remaining {
            self.last_remaining = needs.len() as i64;
            println!("Number of commands: {}", self.commands.len());
            println!("Commands remaining: {}", needs.len());
            self.verbose_now = self.opts.verbose;
        } else {
            self.verbose_now = false;
        }

        let has_inputs =
            filter::inputs_ready(needs.clone(), &self.opts.data_dir, self.verbose_now);
        if !needs.is_empty() && has_inputs.is_empty() && self.running.is_empty() {
            println!("Commands exist without any way to acquire inputs:");
            for c in &needs {
                println!("{}", c.shell_form(&self.opts.data_dir, &self.opts.tmp_dir));
            }
        }

        let fits_gpu = if self.opts.use_slurm {
            // The batch system owns RAM and GPU accounting.
            has_inputs
        } else {
            let (cap, in_use) = match self.ram_figures() {
                Ok(x) => x,
                Err(e) => {
                    log::error(&e);
                    return (vec![], done);
                }
            };
            let fits_ram = filter::fits_ram(
                has_inputs,
                self.reserved_ram_gb,
                in_use,
                cap,
                self.opts.use_skypilot,
                self.verbose_now,
            );
            filter::fits_gpu(
                fits_ram,
                &self.gpu_ram_reserved,
                &self.gpu_ram_cap,
                self.opts.use_skypilot,
                self.verbose_now,
            )
        };
        let fits_cores = filter::fits_cores(
            fits_gpu,
            self.reserved_cores,
            self.max_core_alloc,
            self.opts.use_skypilot,
            self.verbose_now,
        );
        let running_cmds: Vec<&Cmd> = self.running.iter().map(|p| &p.cmd).collect();
        let ready = filter::not_running(fits_cores, &running_cmds);
        (filter::sort_cmds(ready), done)
    }

    // Global admission: a free job slot and the warmup deadline passed.  The deadline is
    // enforced by skipping launches, never by blocking.
    fn admissible(&self) -> bool {
        self.running.len() < self.max_concurrent_jobs
            && self.system.compute_now() >= self.warmup_deadline
    }

    fn ram_figures(&self) -> Result<(f64, f64), String> {
        let mem = self.system.compute_memory()?;
        let cap = VM_PERCENT_CAP * mem.total_gib / 100.0;
        Ok((cap, mem.total_gib - mem.available_gib))
    }

    fn launch(&mut self, cmd: &Cmd) {
        self.reserved_ram_gb += cmd.ram_gb;
        self.reserved_cores += cmd.cores_as_int();

        let pipes_dir = self.opts.tmp_dir.join("pipes").join(cmd.name());
        if let Err(e) = fs::create_dir_all(&pipes_dir) {
            log::error(&format!(
                "Could not create {}: {e}",
                pipes_dir.display()
            ));
            self.reserved_ram_gb -= cmd.ram_gb;
            self.reserved_cores -= cmd.cores_as_int();
            return;
        }
        let stdout_path = pipes_dir.join("stdout.txt");
        let stderr_path = pipes_dir.join("stderr.txt");

        self.create_paths(cmd);

        let mut args = cmd.resolved_argv(&self.opts.data_dir, &self.opts.tmp_dir);
        let mut env: Vec<(String, String)> = std::env::vars().collect();
        for (k, v) in &cmd.env {
            set_env(&mut env, k, v);
        }

        let mut cuda_devices: Vec<usize> = vec![];
        if self.opts.use_skypilot && cmd.remote_template.is_some() {
            match remote::skypilot_args(cmd, &self.opts.data_dir, &self.opts.tmp_dir) {
                Ok(a) => args = a,
                Err(e) => {
                    log::error(&e);
                    self.reserved_ram_gb -= cmd.ram_gb;
                    self.reserved_cores -= cmd.cores_as_int();
                    return;
                }
            }
        } else if self.opts.use_slurm {
            args = remote::slurm_args(cmd, args);
        } else if let Some(gpus) = &cmd.gpus {
            set_env(&mut env, "CUDA_VISIBLE_DEVICES", gpus);
            // The indices in cmd.gpus may not mean what our internal indices mean, so an
            // explicit-gpus command reserves every card for its duration.
            for i in 0..self.gpu_ram_cap.len() {
                self.gpu_ram_reserved[i] = self.gpu_ram_cap[i];
            }
            cuda_devices = (0..self.gpu_ram_cap.len()).collect();
        } else if !self.cuda_devices.is_empty() {
            self.choose_next_gpu();
            set_env(
                &mut env,
                "CUDA_VISIBLE_DEVICES",
                &self.cuda_devices[self.next_gpu],
            );
            self.gpu_ram_reserved[self.next_gpu] += cmd.gpu_ram_gb;
            cuda_devices = vec![self.next_gpu];
        }

        println!("{}", shell_join(&args));
        match self.system.spawn(&args, &env, &stdout_path, &stderr_path) {
            Ok(child) => {
                println!("{}", child.pid());
                self.warmup_deadline = self.system.compute_now() + cmd.warmup_time;
                self.running.push(RunningProcess {
                    cmd: cmd.clone(),
                    child,
                    cuda_devices,
                    max_ram_gb: cmd.ram_gb,
                });
            }
            Err(e) => {
                log::error(&format!("Could not launch {}: {e}", cmd.name()));
                self.reserved_ram_gb -= cmd.ram_gb;
                self.reserved_cores -= cmd.cores_as_int();
                for dev in cuda_devices {
                    if cmd.gpus.is_some() {
                        self.gpu_ram_reserved[dev] = 0.0;
                    } else {
                        self.gpu_ram_reserved[dev] -= cmd.gpu_ram_gb;
                    }
                }
            }
        }
    }

    // Report missing inputs and pre-create the parent directory of every staged output so
    // the child can open its output paths blind.
    fn create_paths(&self, cmd: &Cmd) {
        for input in cmd.inputs() {
            let d = self.opts.data_dir.join(input);
            if !d.exists() {
                log::info(&format!("Missing In file {}", d.display()));
            }
        }
        for out in cmd.outputs() {
            let staged = self.opts.tmp_dir.join(out);
            if let Some(parent) = staged.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    log::error(&format!(
                        "Could not create {} for Out file {out}: {e}",
                        parent.display()
                    ));
                }
            }
        }
    }

    // Advance the round-robin cursor one step per launch, then keep advancing until it
    // rests on a card with the maximum free VRAM.  Round-robin when utilizations are
    // equal, greedy when one card is less loaded.  Run at launch time so that completions
    // since the previous launch are reflected in the choice.
    fn choose_next_gpu(&mut self) {
        if self.gpu_ram_cap.is_empty() {
            return;
        }
        let free: Vec<f64> = self
            .gpu_ram_cap
            .iter()
            .zip(self.gpu_ram_reserved.iter())
            .map(|(cap, reserved)| cap - reserved)
            .collect();
        let max_free = free.iter().fold(f64::NEG_INFINITY, |a, b| a.max(*b));
        loop {
            self.next_gpu = (self.next_gpu + 1) % self.cuda_devices.len();
            if free[self.next_gpu] >= max_free {
                break;
            }
        }
    }

    // The OOM guard.  Reservations are raised to observed use so admission stays honest;
    // when the host is over its cap anyway, the cheapest processes (least accumulated CPU,
    // so the least work is lost) are politely terminated until we are projected back
    // under.
    fn terminate_if_oom(&mut self) {
        let (cap, in_use) = match self.ram_figures() {
            Ok(x) => x,
            Err(e) => {
                log::error(&e);
                return;
            }
        };
        let mut gb_free = cap - in_use;

        let times: Vec<f64> = self
            .running
            .iter()
            .map(|p| {
                self.system
                    .compute_process_cpu_secs(p.child.pid())
                    .unwrap_or(f64::INFINITY)
            })
            .collect();
        let mut order: Vec<usize> = (0..self.running.len()).collect();
        order.sort_by(|a, b| times[*a].total_cmp(&times[*b]));

        for i in order {
            let pid = self.running[i].child.pid();
            // Vanished mid-query: it will be collected as completed this cycle.
            let actual = match self.system.compute_process_memory_gib(pid) {
                Some(x) => x,
                None => continue,
            };
            if actual > self.running[i].max_ram_gb {
                println!(
                    "Command exceeded memory limit ({:.2} > {:.2}): {}",
                    actual,
                    self.running[i].cmd.ram_gb,
                    self.running[i].cmd.name()
                );
                self.reserved_ram_gb += actual - self.running[i].max_ram_gb;
                self.running[i].max_ram_gb = actual;
            }
            if gb_free < 0.0 {
                println!("Terminating process: {}", self.running[i].cmd.name());
                self.running[i].child.terminate();
                gb_free += actual;
            }
        }
    }

    // Non-blocking poll of every child; those with a terminal exit status are removed from
    // the running list.
    fn collect_completed(&mut self) -> Vec<(RunningProcess, i32)> {
        let mut completed = vec![];
        let mut still_running = vec![];
        for mut p in std::mem::take(&mut self.running) {
            match p.child.poll() {
                Some(code) => completed.push((p, code)),
                None => still_running.push(p),
            }
        }
        self.running = still_running;
        completed
    }

    // Release reservations and, on success, publish outputs.  A nonzero exit surfaces the
    // captured stderr; its outputs stay missing, so the command is eligible again next
    // cycle (a command terminated by the OOM guard comes back the same way).
    fn process_completed(&mut self, completed: Vec<(RunningProcess, i32)>) {
        for (p, code) in completed {
            self.reserved_ram_gb -= p.max_ram_gb;
            self.reserved_cores -= p.cmd.cores_as_int();
            for dev in &p.cuda_devices {
                if p.cmd.gpus.is_some() {
                    self.gpu_ram_reserved[*dev] = 0.0;
                } else {
                    self.gpu_ram_reserved[*dev] -= p.cmd.gpu_ram_gb;
                }
            }
            if code != 0 {
                println!("Error running {}", p.cmd.name());
                let stderr_path = self
                    .opts
                    .tmp_dir
                    .join("pipes")
                    .join(p.cmd.name())
                    .join("stderr.txt");
                match fs::read_to_string(&stderr_path) {
                    Ok(s) => print!("{s}"),
                    Err(_) => log::error(&format!("Unable to read {}", stderr_path.display())),
                }
            } else {
                println!("Command complete: {}", p.cmd.name());
                publish::publish_outputs(&p.cmd, &self.opts.data_dir, &self.opts.tmp_dir);
            }
        }
    }
}

fn set_env(env: &mut Vec<(String, String)>, key: &str, value: &str) {
    for pair in env.iter_mut() {
        if pair.0 == key {
            pair.1 = value.to_string();
            return;
        }
    }
    env.push((key.to_string(), value.to_string()));
}

fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|a| util::shell_quote(a))
        .collect::<Vec<String>>()
        .join(" ")
}
