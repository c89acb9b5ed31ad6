use crate::cmd::{Arg, Cmd, CmdBuilder, FileRef};
use crate::filter;

use std::fs;

fn cmd_with_output(program: &str, out: &str) -> Cmd {
    CmdBuilder::new(vec![
        Arg::Literal(program.to_string()),
        Arg::File(FileRef::Out(out.to_string())),
    ])
    .freeze()
    .unwrap()
}

fn cmd_no_outputs(program: &str) -> Cmd {
    CmdBuilder::new(vec![Arg::Literal(program.to_string())])
        .freeze()
        .unwrap()
}

#[test]
pub fn test_needs_output() {
    let data = tempfile::tempdir().unwrap();
    fs::write(data.path().join("done.txt"), b"").unwrap();
    let done = cmd_with_output("a", "done.txt");
    let pending = cmd_with_output("b", "pending.txt");
    // A command with no outputs is malformed and dropped
    let malformed = cmd_no_outputs("c");
    let kept = filter::needs_output(
        vec![done, pending.clone(), malformed],
        data.path(),
    );
    assert!(kept == vec![pending]);
}

#[test]
pub fn test_needs_output_partial() {
    // One output present, one missing: still needs output
    let data = tempfile::tempdir().unwrap();
    fs::write(data.path().join("half.txt"), b"").unwrap();
    let c = CmdBuilder::new(vec![
        Arg::Literal("x".to_string()),
        Arg::File(FileRef::Out("half.txt".to_string())),
    ])
    .with_extra_output(FileRef::Out("other-half.txt".to_string()))
    .freeze()
    .unwrap();
    assert!(filter::needs_output(vec![c.clone()], data.path()) == vec![c]);
}

#[test]
pub fn test_inputs_ready() {
    let data = tempfile::tempdir().unwrap();
    fs::write(data.path().join("have.txt"), b"").unwrap();
    let ready = CmdBuilder::new(vec![
        Arg::Literal("x".to_string()),
        Arg::File(FileRef::In("have.txt".to_string())),
        Arg::File(FileRef::Out("o1.txt".to_string())),
    ])
    .freeze()
    .unwrap();
    let waiting = CmdBuilder::new(vec![
        Arg::Literal("y".to_string()),
        Arg::File(FileRef::Out("o2.txt".to_string())),
    ])
    .with_extra_input(FileRef::In("nothave.txt".to_string()))
    .freeze()
    .unwrap();
    let kept = filter::inputs_ready(vec![ready.clone(), waiting], data.path(), false);
    assert!(kept == vec![ready]);
}

#[test]
pub fn test_fits_ram() {
    let mk = |ram: f64| {
        CmdBuilder::new(vec![Arg::Literal(format!("r{ram}"))])
            .with_ram_gb(ram)
            .freeze()
            .unwrap()
    };
    // Exactly hitting the cap admits
    let kept = filter::fits_ram(vec![mk(2.0)], 6.0, 0.0, 8.0, false, false);
    assert!(kept.len() == 1);
    let kept = filter::fits_ram(vec![mk(2.1)], 6.0, 0.0, 8.0, false, false);
    assert!(kept.is_empty());
    // Real use higher than reservations is what counts
    let kept = filter::fits_ram(vec![mk(2.0)], 0.0, 7.0, 8.0, false, false);
    assert!(kept.is_empty());
    // The skypilot bypass only applies to commands with a template
    let c = CmdBuilder::new(vec![Arg::Literal("big".to_string())])
        .with_ram_gb(100.0)
        .with_remote_template("sky.yaml")
        .freeze()
        .unwrap();
    assert!(filter::fits_ram(vec![c.clone()], 0.0, 0.0, 8.0, true, false).len() == 1);
    assert!(filter::fits_ram(vec![c], 0.0, 0.0, 8.0, false, false).is_empty());
}

#[test]
pub fn test_fits_gpu() {
    let gpu_cmd = |vram: f64| {
        CmdBuilder::new(vec![Arg::Literal(format!("g{vram}"))])
            .with_gpu_ram_gb(vram)
            .freeze()
            .unwrap()
    };
    let cap = vec![8.0, 8.0];
    // Admission keys off the best card's free VRAM
    let kept = filter::fits_gpu(vec![gpu_cmd(6.0)], &[0.0, 0.0], &cap, false, false);
    assert!(kept.len() == 1);
    // One busy card does not block a command the other card can host
    let kept = filter::fits_gpu(vec![gpu_cmd(6.0)], &[6.0, 0.0], &cap, false, false);
    assert!(kept.len() == 1);
    // But when no card can host it, it waits
    let kept = filter::fits_gpu(vec![gpu_cmd(6.0)], &[6.0, 6.0], &cap, false, false);
    assert!(kept.is_empty());
    // No GPU needed: admissible even with no cards at all
    let cpu_only = gpu_cmd(0.0);
    assert!(filter::fits_gpu(vec![cpu_only.clone()], &[], &[], false, false).len() == 1);
    // But a VRAM requirement cannot be met without cards
    assert!(filter::fits_gpu(vec![gpu_cmd(1.0)], &[], &[], false, false).is_empty());

    // Explicit gpus: only admissible while every reservation is zero
    let explicit = CmdBuilder::new(vec![Arg::Literal("e".to_string())])
        .with_gpus("0,1")
        .freeze()
        .unwrap();
    assert!(filter::fits_gpu(vec![explicit.clone()], &[0.0, 0.0], &cap, false, false).len() == 1);
    assert!(filter::fits_gpu(vec![explicit], &[0.5, 0.0], &cap, false, false).is_empty());
}

#[test]
pub fn test_fits_cores() {
    let mk = |cores: u32| {
        CmdBuilder::new(vec![Arg::Literal(format!("c{cores}"))])
            .with_cores(cores)
            .freeze()
            .unwrap()
    };
    assert!(filter::fits_cores(vec![mk(2)], 6, 8, false, false).len() == 1);
    assert!(filter::fits_cores(vec![mk(3)], 6, 8, false, false).is_empty());
    // A command without a cores declaration counts as one core
    let dflt = CmdBuilder::new(vec![Arg::Literal("d".to_string())])
        .freeze()
        .unwrap();
    assert!(filter::fits_cores(vec![dflt], 7, 8, false, false).len() == 1);
}

#[test]
pub fn test_not_running() {
    let a = cmd_with_output("a", "a.txt");
    let b = cmd_with_output("b", "b.txt");
    let running = vec![&a];
    let kept = filter::not_running(vec![a.clone(), b.clone()], &running);
    assert!(kept == vec![b]);
}

#[test]
pub fn test_sort_is_stable() {
    let mk = |program: &str, prio: i64| {
        CmdBuilder::new(vec![Arg::Literal(program.to_string())])
            .with_priority(vec![prio])
            .freeze()
            .unwrap()
    };
    let sorted = filter::sort_cmds(vec![mk("first", 5), mk("second", 5), mk("urgent", 9)]);
    assert!(sorted[0].argv[0] == Arg::Literal("urgent".to_string()));
    assert!(sorted[1].argv[0] == Arg::Literal("first".to_string()));
    assert!(sorted[2].argv[0] == Arg::Literal("second".to_string()));
}
