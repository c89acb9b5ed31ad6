use crate::cmd::{Arg, Cmd, CmdBuilder, FileRef};
use crate::log;
use crate::util;

use std::fs;

// The catalog loader: reads the experiment file and returns the current set of commands.
//
// The file is a line-oriented stanza format.  A line starting with `cmd` opens a new
// command and the rest of the line is its argv; tokens prefixed `in:` or `out:` are file
// references, everything else is literal.  Subsequent property lines, until the next `cmd`
// line, refine the open command:
//
//     # train one seed
//     cmd python train.py --config in:cfg.json --out out:model.pkl
//       ram_gb 4
//       cores 2
//       gpu_ram_gb 6
//       priority 10 -1
//       warmup 1.5
//       env FOO=bar
//       extra_in seeds/seed0.txt
//       extra_out logs/metrics.csv
//       remote templates/sky.yaml
//
// Blank lines and lines starting with # are ignored.  Indentation is not significant.
//
// The loader is called once per scheduler cycle; identical files produce equal command
// sets (duplicates are dropped), which is what lets the scheduler recognize running
// commands across reloads.  Syntactic errors carry a 1-based line number and leave the
// previous catalog in force at the caller; a command that parses but fails validation
// (say, both gpus and gpu_ram_gb) is reported and dropped while the rest of the catalog
// stays usable.

#[derive(Debug, PartialEq)]
pub struct CatalogError {
    pub line: Option<usize>,
    pub message: String,
}

impl CatalogError {
    fn at(line: usize, message: String) -> CatalogError {
        CatalogError {
            line: Some(line),
            message,
        }
    }

    pub fn render(&self) -> String {
        match self.line {
            Some(n) => format!("line {n}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

pub fn load(path: &str) -> Result<Vec<Cmd>, CatalogError> {
    let content = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => {
            return Err(CatalogError {
                line: None,
                message: format!("Unable to read {path}"),
            })
        }
    };
    parse(&content)
}

pub fn parse(content: &str) -> Result<Vec<Cmd>, CatalogError> {
    let mut cmds: Vec<Cmd> = vec![];
    let mut open: Option<(usize, CmdBuilder)> = None;

    for (lineno, line) in content.lines().enumerate() {
        let lineno = lineno + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (_ix, parts) = util::chunks(trimmed);
        if parts[0] == "cmd" {
            finish(&mut cmds, open.take());
            if parts.len() < 2 {
                return Err(CatalogError::at(lineno, "cmd requires an argv".to_string()));
            }
            let argv = parts[1..].iter().map(|t| parse_arg(t)).collect();
            open = Some((lineno, CmdBuilder::new(argv)));
        } else {
            let (start_line, builder) = match open.take() {
                Some(x) => x,
                None => {
                    return Err(CatalogError::at(
                        lineno,
                        format!("Property before any cmd: {}", parts[0]),
                    ))
                }
            };
            let updated = apply_property(builder, &parts, lineno)?;
            open = Some((start_line, updated));
        }
    }
    finish(&mut cmds, open.take());
    Ok(cmds)
}

fn finish(cmds: &mut Vec<Cmd>, open: Option<(usize, CmdBuilder)>) {
    if let Some((lineno, builder)) = open {
        match builder.freeze() {
            Ok(c) => {
                if !cmds.contains(&c) {
                    cmds.push(c);
                }
            }
            Err(e) => {
                // Invalid, but only for this command: refuse to register it and carry on.
                log::error(&format!("Invalid command (line {lineno}): {}", e.0));
            }
        }
    }
}

fn parse_arg(token: &str) -> Arg {
    if let Some(f) = token.strip_prefix("in:") {
        Arg::File(FileRef::In(f.to_string()))
    } else if let Some(f) = token.strip_prefix("out:") {
        Arg::File(FileRef::Out(f.to_string()))
    } else {
        Arg::Literal(token.to_string())
    }
}

fn apply_property(
    builder: CmdBuilder,
    parts: &[&str],
    lineno: usize,
) -> Result<CmdBuilder, CatalogError> {
    let key = parts[0];
    let values = &parts[1..];
    let one_value = |what: &str| -> Result<&str, CatalogError> {
        if values.len() == 1 {
            Ok(values[0])
        } else {
            Err(CatalogError::at(lineno, format!("{key} requires one {what}")))
        }
    };
    match key {
        "ram_gb" => Ok(builder.with_ram_gb(parse_f64(one_value("number")?, key, lineno)?)),
        "gpu_ram_gb" => {
            Ok(builder.with_gpu_ram_gb(parse_f64(one_value("number")?, key, lineno)?))
        }
        "warmup" => Ok(builder.with_warmup_time(parse_f64(one_value("number")?, key, lineno)?)),
        "cores" => {
            let v = one_value("number")?;
            match v.parse::<u32>() {
                Ok(n) => Ok(builder.with_cores(n)),
                Err(_) => Err(CatalogError::at(
                    lineno,
                    format!("Could not parse cores: {v}"),
                )),
            }
        }
        "priority" => {
            if values.is_empty() {
                return Err(CatalogError::at(
                    lineno,
                    "priority requires at least one integer".to_string(),
                ));
            }
            let mut prio = vec![];
            for v in values {
                match v.parse::<i64>() {
                    Ok(n) => prio.push(n),
                    Err(_) => {
                        return Err(CatalogError::at(
                            lineno,
                            format!("Could not parse priority: {v}"),
                        ))
                    }
                }
            }
            Ok(builder.with_priority(prio))
        }
        "gpus" => Ok(builder.with_gpus(one_value("device list")?)),
        "env" => {
            let v = one_value("KEY=VALUE")?;
            match v.split_once('=') {
                Some((k, val)) => Ok(builder.with_env(k, val)),
                None => Err(CatalogError::at(
                    lineno,
                    format!("env requires KEY=VALUE: {v}"),
                )),
            }
        }
        "extra_in" => Ok(builder.with_extra_input(FileRef::In(one_value("path")?.to_string()))),
        "extra_out" => {
            Ok(builder.with_extra_output(FileRef::Out(one_value("path")?.to_string())))
        }
        "remote" => Ok(builder.with_remote_template(one_value("path")?)),
        _ => Err(CatalogError::at(lineno, format!("Unknown property: {key}"))),
    }
}

fn parse_f64(v: &str, key: &str, lineno: usize) -> Result<f64, CatalogError> {
    match v.parse::<f64>() {
        Ok(n) => Ok(n),
        Err(_) => Err(CatalogError::at(
            lineno,
            format!("Could not parse {key}: {v}"),
        )),
    }
}
