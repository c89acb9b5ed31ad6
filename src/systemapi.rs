use std::path::Path;

// The scheduler's window onto the computing system.  Everything the loop touches in the OS
// (clocks, memory figures, GPUs, child processes) goes through this trait, allowing the
// system to be virtualized.  In turn, that allows sensible test cases to be written for the
// scheduling logic.
//
// Naming: the `get_` methods always return the same values for every call.  The `compute_`
// methods recompute the data and the values may change between calls.

// Host memory figures in GiB.
#[derive(Clone, Copy, Debug)]
pub struct Memory {
    pub total_gib: f64,
    pub available_gib: f64,
}

// A spawned child process.  poll() is non-blocking: None while the child runs, then the
// exit code forever after (negative for a signal-terminated child).  terminate() sends a
// polite termination request (SIGTERM), never SIGKILL.
pub trait ChildHandle {
    fn pid(&self) -> u32;
    fn poll(&mut self) -> Option<i32>;
    fn terminate(&mut self);
}

pub trait SystemAPI {
    // Monotonic time in seconds from an arbitrary origin.
    fn compute_now(&self) -> f64;

    // Sleep for (roughly) the given number of seconds.
    fn sleep(&self, seconds: f64);

    fn get_cpu_count(&self) -> usize;

    // Total and currently-available host memory.
    fn compute_memory(&self) -> Result<Memory, String>;

    // Real memory use of a child in GiB: proportional set size + unique set size, or
    // unique set size alone where the kernel does not account PSS.  None if the process
    // has vanished.
    fn compute_process_memory_gib(&self, pid: u32) -> Option<f64>;

    // Accumulated CPU seconds (user + system, including reaped children) of a child.
    // None if the process has vanished.
    fn compute_process_cpu_secs(&self, pid: u32) -> Option<f64>;

    // Visible GPU devices, as device-index strings, and their free VRAM in GiB.
    fn compute_gpu_devices(&self) -> Vec<String>;
    fn compute_gpu_free_vram_gib(&self, devices: &[String]) -> Vec<f64>;

    // Spawn a child with the given argv and complete environment, stdout and stderr
    // appended to the given files.
    fn spawn(
        &self,
        argv: &[String],
        env: &[(String, String)],
        stdout_path: &Path,
        stderr_path: &Path,
    ) -> Result<Box<dyn ChildHandle>, String>;

    fn srun_available(&self) -> bool;

    // `handle_interruptions` enables interrupt checking; `is_interrupted` returns true if
    // an interrupt has been received.
    fn handle_interruptions(&self);
    fn is_interrupted(&self) -> bool;
}
