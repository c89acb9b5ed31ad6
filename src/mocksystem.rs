use crate::systemapi::{ChildHandle, Memory, SystemAPI};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

// MockSystem is used for testing the scheduler loop: it is instantiated with the values we
// want it to return, time only moves when the loop sleeps (or a test calls advance()), and
// children are scripted per program name instead of spawned.

// Scripted behavior for every spawn of a given program name.
#[derive(Clone)]
pub struct ExecPlan {
    // Mock seconds from spawn until the child exits on its own.
    pub duration: f64,
    pub exit_code: i32,
    // Observed PSS+USS while the child runs.
    pub mem_gib: f64,
    // Files created (empty) when the child exits successfully; tests pass staged paths.
    pub creates: Vec<PathBuf>,
}

impl Default for ExecPlan {
    fn default() -> ExecPlan {
        ExecPlan {
            duration: 1.0,
            exit_code: 0,
            mem_gib: 0.0,
            creates: vec![],
        }
    }
}

struct ChildState {
    pid: u32,
    start: f64,
    plan: ExecPlan,
    terminated: bool,
    finished: Option<i32>,
}

pub struct MockChild {
    clock: Rc<Cell<f64>>,
    state: Rc<RefCell<ChildState>>,
}

impl ChildHandle for MockChild {
    fn pid(&self) -> u32 {
        self.state.borrow().pid
    }

    fn poll(&mut self) -> Option<i32> {
        let mut st = self.state.borrow_mut();
        if st.finished.is_some() {
            return st.finished;
        }
        if st.terminated {
            st.finished = Some(-libc::SIGTERM);
        } else if self.clock.get() >= st.start + st.plan.duration {
            if st.plan.exit_code == 0 {
                for f in &st.plan.creates {
                    if let Some(parent) = f.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    let _ = std::fs::write(f, b"");
                }
            }
            st.finished = Some(st.plan.exit_code);
        }
        st.finished
    }

    fn terminate(&mut self) {
        self.state.borrow_mut().terminated = true;
    }
}

#[derive(Default)]
pub struct MockSystemBuilder {
    cpu_count: Option<usize>,
    memory: Option<(f64, f64)>,
    gpus: Vec<(String, f64)>,
    plans: HashMap<String, ExecPlan>,
}

#[allow(dead_code)]
impl MockSystemBuilder {
    pub fn with_cpu_count(self, cpu_count: usize) -> MockSystemBuilder {
        MockSystemBuilder {
            cpu_count: Some(cpu_count),
            ..self
        }
    }

    pub fn with_memory(self, total_gib: f64, available_gib: f64) -> MockSystemBuilder {
        MockSystemBuilder {
            memory: Some((total_gib, available_gib)),
            ..self
        }
    }

    pub fn with_gpu(mut self, device: &str, free_vram_gib: f64) -> MockSystemBuilder {
        self.gpus.push((device.to_string(), free_vram_gib));
        self
    }

    pub fn with_exec(mut self, program: &str, plan: ExecPlan) -> MockSystemBuilder {
        self.plans.insert(program.to_string(), plan);
        self
    }

    pub fn freeze(self) -> MockSystem {
        let (total_gib, available_gib) = self.memory.unwrap_or((64.0, 60.0));
        MockSystem {
            clock: Rc::new(Cell::new(0.0)),
            cpu_count: self.cpu_count.unwrap_or(8),
            memory: RefCell::new(Memory {
                total_gib,
                available_gib,
            }),
            gpus: self.gpus,
            plans: self.plans,
            children: RefCell::new(vec![]),
            next_pid: Cell::new(1000),
            spawned: RefCell::new(vec![]),
        }
    }
}

pub struct MockSystem {
    clock: Rc<Cell<f64>>,
    cpu_count: usize,
    memory: RefCell<Memory>,
    gpus: Vec<(String, f64)>,
    plans: HashMap<String, ExecPlan>,
    children: RefCell<Vec<Rc<RefCell<ChildState>>>>,
    next_pid: Cell<u32>,
    spawned: RefCell<Vec<(Vec<String>, Vec<(String, String)>)>>,
}

#[allow(dead_code)]
impl MockSystem {
    pub fn new() -> MockSystemBuilder {
        MockSystemBuilder {
            ..Default::default()
        }
    }

    pub fn advance(&self, seconds: f64) {
        self.clock.set(self.clock.get() + seconds);
    }

    pub fn set_available_gib(&self, available_gib: f64) {
        self.memory.borrow_mut().available_gib = available_gib;
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.borrow().len()
    }

    pub fn spawned_argv(&self, i: usize) -> Vec<String> {
        self.spawned.borrow()[i].0.clone()
    }

    pub fn spawned_env(&self, i: usize, key: &str) -> Option<String> {
        self.spawned.borrow()[i]
            .1
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

impl SystemAPI for MockSystem {
    fn compute_now(&self) -> f64 {
        self.clock.get()
    }

    fn sleep(&self, seconds: f64) {
        self.advance(seconds);
    }

    fn get_cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn compute_memory(&self) -> Result<Memory, String> {
        Ok(*self.memory.borrow())
    }

    fn compute_process_memory_gib(&self, pid: u32) -> Option<f64> {
        for child in self.children.borrow().iter() {
            let st = child.borrow();
            if st.pid == pid {
                if st.finished.is_some() {
                    return None;
                }
                return Some(st.plan.mem_gib);
            }
        }
        None
    }

    fn compute_process_cpu_secs(&self, pid: u32) -> Option<f64> {
        for child in self.children.borrow().iter() {
            let st = child.borrow();
            if st.pid == pid {
                if st.finished.is_some() {
                    return None;
                }
                return Some(self.clock.get() - st.start);
            }
        }
        None
    }

    fn compute_gpu_devices(&self) -> Vec<String> {
        self.gpus.iter().map(|(d, _)| d.clone()).collect()
    }

    fn compute_gpu_free_vram_gib(&self, devices: &[String]) -> Vec<f64> {
        devices
            .iter()
            .map(|d| {
                self.gpus
                    .iter()
                    .find(|(name, _)| name == d)
                    .map(|(_, vram)| *vram)
                    .unwrap_or(0.0)
            })
            .collect()
    }

    fn spawn(
        &self,
        argv: &[String],
        env: &[(String, String)],
        _stdout_path: &Path,
        _stderr_path: &Path,
    ) -> Result<Box<dyn ChildHandle>, String> {
        let plan = self
            .plans
            .get(&argv[0])
            .cloned()
            .unwrap_or_default();
        let pid = self.next_pid.get();
        self.next_pid.set(pid + 1);
        let state = Rc::new(RefCell::new(ChildState {
            pid,
            start: self.clock.get(),
            plan,
            terminated: false,
            finished: None,
        }));
        self.children.borrow_mut().push(state.clone());
        self.spawned
            .borrow_mut()
            .push((argv.to_vec(), env.to_vec()));
        Ok(Box::new(MockChild {
            clock: self.clock.clone(),
            state,
        }))
    }

    fn srun_available(&self) -> bool {
        false
    }

    fn handle_interruptions(&self) {
        // Nothing
    }

    fn is_interrupted(&self) -> bool {
        false
    }
}
