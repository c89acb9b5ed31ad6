use crate::cmd::Cmd;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

// Remote execution adapters.  Both rewrite the argv the supervisor was about to spawn;
// resource enforcement is delegated to the remote side.

// Cluster batch adapter: wrap the resolved argv in an srun allocation derived from the
// command's declared cores and RAM.  srun enforces what the local scheduler only tracks.
pub fn slurm_args(cmd: &Cmd, args: Vec<String>) -> Vec<String> {
    let mut wrapped = vec!["srun".to_string()];
    let mb_per_core = match cmd.cores {
        None => (1024.0 * cmd.ram_gb) as u64,
        Some(cores) => {
            wrapped.push(format!("--cpus-per-task={cores}"));
            (1024.0 * cmd.ram_gb / cores as f64).ceil() as u64
        }
    };
    wrapped.push(format!("--mem-per-cpu={mb_per_core}M"));
    wrapped.push("--".to_string());
    wrapped.extend(args);
    wrapped
}

// Cloud sandbox adapter: materialize a task descriptor by substituting the command's
// shell form into the user-supplied template, then hand the descriptor to the wrapper
// program together with the staged path of every declared output so the wrapper can fetch
// them back when the sandbox finishes.
//
// The wrapper (`expsched-skypilot`) is an external collaborator; we only compose its argv.
pub fn skypilot_args(cmd: &Cmd, data_dir: &Path, tmp_dir: &Path) -> Result<Vec<String>, String> {
    let template_path = match &cmd.remote_template {
        Some(t) => t,
        None => return Err("Command has no remote template".to_string()),
    };
    let cwd = std::env::current_dir().map_err(|e| format!("Could not get cwd: {e}"))?;
    let data_rel = rel_to(data_dir, &cwd);
    let tmp_rel = rel_to(tmp_dir, &cwd);
    let command = cmd.shell_form(&data_rel, &tmp_rel);

    let template = fs::read_to_string(template_path)
        .map_err(|_| format!("Unable to read {template_path}"))?;
    let task_yaml = template.replace("{command}", &command);

    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .map_err(|e| format!("Could not create task file: {e}"))?;
    file.write_all(task_yaml.as_bytes())
        .map_err(|e| format!("Could not write task file: {e}"))?;
    // The wrapper owns the file from here; keep it on disk.
    let (_, task_path) = file
        .keep()
        .map_err(|e| format!("Could not keep task file: {e}"))?;

    let mut args = vec![
        "expsched-skypilot".to_string(),
        "--task-file".to_string(),
        task_path.to_string_lossy().to_string(),
    ];
    for out in cmd.outputs() {
        args.push("--out-file".to_string());
        args.push(tmp_rel.join(out).to_string_lossy().to_string());
    }
    Ok(args)
}

// The path relative to base when it lies under base, otherwise the path unchanged.
fn rel_to(p: &Path, base: &Path) -> PathBuf {
    match p.strip_prefix(base) {
        Ok(rest) if rest.as_os_str().is_empty() => PathBuf::from("."),
        Ok(rest) => rest.to_path_buf(),
        Err(_) => p.to_path_buf(),
    }
}
