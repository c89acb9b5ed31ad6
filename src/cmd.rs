use crate::util;

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

// The immutable description of one experiment process.  Identity is structural equality of
// all fields; the scheduler relies on that to recognize a command across catalog reloads
// (see filter::not_running) so nothing here may be mutated after freeze().

// A file mentioned by a command.  In files are resolved against the data directory and must
// exist before the command may run; Out files are resolved against the staging directory
// while being produced, and their presence under the data directory is the completion
// signal.
#[derive(Debug, Clone, PartialEq)]
pub enum FileRef {
    In(String),
    Out(String),
}

impl FileRef {
    pub fn filename(&self) -> &str {
        match self {
            FileRef::In(f) => f,
            FileRef::Out(f) => f,
        }
    }
}

// One argv element: a literal string or a file reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(String),
    File(FileRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidCommand(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct Cmd {
    pub argv: Vec<Arg>,
    pub extra_inputs: Vec<FileRef>,
    pub extra_outputs: Vec<FileRef>,
    pub warmup_time: f64,
    pub ram_gb: f64,
    pub priority: Vec<i64>,
    pub gpus: Option<String>,
    pub gpu_ram_gb: f64,
    pub cores: Option<u32>,
    pub remote_template: Option<String>,
    pub env: Vec<(String, String)>,
}

// Builder for Cmd; all validation happens in freeze().
pub struct CmdBuilder {
    argv: Vec<Arg>,
    extra_inputs: Vec<FileRef>,
    extra_outputs: Vec<FileRef>,
    warmup_time: f64,
    ram_gb: f64,
    priority: Vec<i64>,
    gpus: Option<String>,
    gpu_ram_gb: f64,
    cores: Option<u32>,
    remote_template: Option<String>,
    env: Vec<(String, String)>,
}

#[allow(dead_code)]
impl CmdBuilder {
    pub fn new(argv: Vec<Arg>) -> CmdBuilder {
        CmdBuilder {
            argv,
            extra_inputs: vec![],
            extra_outputs: vec![],
            warmup_time: 1.0,
            ram_gb: 4.0,
            priority: vec![10],
            gpus: None,
            gpu_ram_gb: 0.0,
            cores: None,
            remote_template: None,
            env: vec![],
        }
    }

    pub fn with_ram_gb(self, ram_gb: f64) -> CmdBuilder {
        CmdBuilder { ram_gb, ..self }
    }

    pub fn with_cores(self, cores: u32) -> CmdBuilder {
        CmdBuilder {
            cores: Some(cores),
            ..self
        }
    }

    pub fn with_gpu_ram_gb(self, gpu_ram_gb: f64) -> CmdBuilder {
        CmdBuilder { gpu_ram_gb, ..self }
    }

    pub fn with_gpus(self, gpus: &str) -> CmdBuilder {
        CmdBuilder {
            gpus: Some(gpus.to_string()),
            ..self
        }
    }

    pub fn with_warmup_time(self, warmup_time: f64) -> CmdBuilder {
        CmdBuilder {
            warmup_time,
            ..self
        }
    }

    // A bare scalar priority is the same as a 1-element vector.
    pub fn with_priority(self, priority: Vec<i64>) -> CmdBuilder {
        CmdBuilder { priority, ..self }
    }

    pub fn with_extra_input(mut self, f: FileRef) -> CmdBuilder {
        self.extra_inputs.push(f);
        self
    }

    pub fn with_extra_output(mut self, f: FileRef) -> CmdBuilder {
        self.extra_outputs.push(f);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> CmdBuilder {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_remote_template(self, template: &str) -> CmdBuilder {
        CmdBuilder {
            remote_template: Some(template.to_string()),
            ..self
        }
    }

    pub fn freeze(self) -> Result<Cmd, InvalidCommand> {
        if self.argv.is_empty() {
            return Err(InvalidCommand("Empty argv".to_string()));
        }
        if self.gpus.is_some() && self.gpu_ram_gb > 0.0 {
            return Err(InvalidCommand(
                "Only gpus or gpu_ram_gb should be passed".to_string(),
            ));
        }
        if self.ram_gb < 0.0 || self.gpu_ram_gb < 0.0 || self.warmup_time < 0.0 {
            return Err(InvalidCommand(
                "Resource declarations must be nonnegative".to_string(),
            ));
        }
        if self.cores == Some(0) {
            return Err(InvalidCommand("cores must be at least 1".to_string()));
        }
        if self.priority.is_empty() {
            return Err(InvalidCommand("Empty priority".to_string()));
        }
        for f in &self.extra_inputs {
            if let FileRef::Out(name) = f {
                return Err(InvalidCommand(format!(
                    "Output file in extra_inputs: {name}"
                )));
            }
        }
        for f in &self.extra_outputs {
            if let FileRef::In(name) = f {
                return Err(InvalidCommand(format!(
                    "Input file in extra_outputs: {name}"
                )));
            }
        }
        Ok(Cmd {
            argv: self.argv,
            extra_inputs: self.extra_inputs,
            extra_outputs: self.extra_outputs,
            warmup_time: self.warmup_time,
            ram_gb: self.ram_gb,
            priority: self.priority,
            gpus: self.gpus,
            gpu_ram_gb: self.gpu_ram_gb,
            cores: self.cores,
            remote_template: self.remote_template,
            env: self.env,
        })
    }
}

impl Cmd {
    pub fn cores_as_int(&self) -> u32 {
        match self.cores {
            Some(n) => n.max(1),
            None => 1,
        }
    }

    // Every declared output: Out refs in argv plus extra_outputs, in that order.  Outputs
    // that appear only in extra_outputs are supported and treated the same as argv outputs.
    pub fn outputs(&self) -> Vec<&str> {
        let mut outs = vec![];
        for arg in &self.argv {
            if let Arg::File(FileRef::Out(f)) = arg {
                outs.push(f.as_str());
            }
        }
        for f in &self.extra_outputs {
            outs.push(f.filename());
        }
        outs
    }

    pub fn inputs(&self) -> Vec<&str> {
        let mut ins = vec![];
        for arg in &self.argv {
            if let Arg::File(FileRef::In(f)) = arg {
                ins.push(f.as_str());
            }
        }
        for f in &self.extra_inputs {
            ins.push(f.filename());
        }
        ins
    }

    // Resolve argv to concrete paths: In files under the data directory, Out files under
    // the staging directory, literals unchanged.  No code path resolves an In file to the
    // staging directory.
    pub fn resolved_argv(&self, data_dir: &Path, tmp_dir: &Path) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| match arg {
                Arg::Literal(s) => s.clone(),
                Arg::File(FileRef::In(f)) => path_str(&data_dir.join(f)),
                Arg::File(FileRef::Out(f)) => path_str(&tmp_dir.join(f)),
            })
            .collect()
    }

    pub fn shell_form(&self, data_dir: &Path, tmp_dir: &Path) -> String {
        self.resolved_argv(data_dir, tmp_dir)
            .iter()
            .map(|a| util::shell_quote(a))
            .collect::<Vec<String>>()
            .join(" ")
    }

    // A filesystem-safe name for the command, used for its pipes directory: argv tokens
    // joined with spaces, path separators replaced with U+2571 (a lookalike that is not a
    // separator), truncated to 200 characters.
    pub fn name(&self) -> String {
        let tokens = self
            .argv
            .iter()
            .map(|arg| match arg {
                Arg::Literal(s) => s.as_str(),
                Arg::File(f) => f.filename(),
            })
            .collect::<Vec<&str>>();
        let name = tokens.join(" ").replace('/', "\u{2571}");
        name.chars().take(200).collect()
    }
}

fn path_str(p: &PathBuf) -> String {
    p.to_string_lossy().to_string()
}

// Total order over commands: highest priority first (vectors compared element-wise, a
// shorter vector winning over a longer one with an equal prefix, so (10) runs before
// (10,-1) and a bare 10 is the same as (10)); then smaller warmup_time; then smaller
// ram_gb.  Ties are broken by the caller's stable sort.
pub fn cmd_order(a: &Cmd, b: &Cmd) -> Ordering {
    let neg_a: Vec<i64> = a.priority.iter().map(|p| -p).collect();
    let neg_b: Vec<i64> = b.priority.iter().map(|p| -p).collect();
    neg_a
        .cmp(&neg_b)
        .then(a.warmup_time.total_cmp(&b.warmup_time))
        .then(a.ram_gb.total_cmp(&b.ram_gb))
}
