use crate::cmd::Cmd;
use crate::log;

use std::fs;
use std::io;
use std::path::Path;

// Promotion of a completed command's outputs from the staging directory to the data
// directory.  The presence of a file under the data directory is the completion signal
// other commands key off, so each output must appear there all at once: rename when the
// two directories are on the same filesystem, otherwise copy to a temporary sibling of
// the destination and rename that into place.  A failed output is logged and the rest are
// still attempted.

pub fn publish_outputs(cmd: &Cmd, data_dir: &Path, tmp_dir: &Path) {
    for out in cmd.outputs() {
        let staged = tmp_dir.join(out);
        let fin = data_dir.join(out);
        if let Some(parent) = fin.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                log::error(&format!(
                    "Could not create {} for output {out}: {e}",
                    parent.display()
                ));
                continue;
            }
        }
        if let Err(e) = promote(&staged, &fin) {
            log::error(&format!(
                "Could not copy output {} for command {}: {e}",
                staged.display(),
                cmd.name()
            ));
        }
    }
}

fn promote(staged: &Path, fin: &Path) -> io::Result<()> {
    // Same filesystem: done in one step.
    if fs::rename(staged, fin).is_ok() {
        return Ok(());
    }
    // Cross-filesystem (or the destination directory already exists): copy into a
    // temporary sibling, then rename into place so readers see all or nothing.
    let parent = fin.parent().unwrap_or(Path::new("."));
    let base = fin
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "out".to_string());
    let tmp = parent.join(format!(".{base}.{}.partial", std::process::id()));
    if staged.is_dir() {
        copy_dir_recursive(staged, &tmp)?;
    } else {
        fs::copy(staged, &tmp)?;
    }
    match fs::rename(&tmp, fin) {
        Ok(_) => Ok(()),
        Err(e) => {
            // A directory may already exist at the destination from an earlier partial
            // publish; merge into it rather than failing the whole output.
            if staged.is_dir() && fin.is_dir() {
                let r = merge_dir(&tmp, fin);
                let _ = fs::remove_dir_all(&tmp);
                r
            } else {
                let _ = fs::remove_dir_all(&tmp);
                let _ = fs::remove_file(&tmp);
                Err(e)
            }
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

// Move the contents of src into an existing dst, overwriting files.
fn merge_dir(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&target)?;
            merge_dir(&entry.path(), &target)?;
        } else {
            let _ = fs::remove_file(&target);
            fs::rename(entry.path(), &target).or_else(|_| {
                fs::copy(entry.path(), &target).map(|_| ())
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmd::{Arg, CmdBuilder, FileRef};

    #[test]
    fn test_publish_file_and_dir() {
        let data = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("deep")).unwrap();
        fs::write(tmp.path().join("deep/a.txt"), b"payload").unwrap();
        fs::create_dir_all(tmp.path().join("run0/logs")).unwrap();
        fs::write(tmp.path().join("run0/logs/l.txt"), b"log").unwrap();

        let c = CmdBuilder::new(vec![
            Arg::Literal("x".to_string()),
            Arg::File(FileRef::Out("deep/a.txt".to_string())),
        ])
        .with_extra_output(FileRef::Out("run0".to_string()))
        .freeze()
        .unwrap();

        publish_outputs(&c, data.path(), tmp.path());
        assert!(fs::read_to_string(data.path().join("deep/a.txt")).unwrap() == "payload");
        assert!(fs::read_to_string(data.path().join("run0/logs/l.txt")).unwrap() == "log");
    }

    #[test]
    fn test_copy_dir_recursive() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("a/b/c.txt"), b"c").unwrap();
        let target = dst.path().join("copied");
        copy_dir_recursive(src.path(), &target).unwrap();
        assert!(fs::read_to_string(target.join("a/b/c.txt")).unwrap() == "c");
    }

    #[test]
    fn test_missing_staged_output_is_not_fatal() {
        let data = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let c = CmdBuilder::new(vec![
            Arg::Literal("x".to_string()),
            Arg::File(FileRef::Out("never-made.txt".to_string())),
        ])
        .freeze()
        .unwrap();
        // Logs an error, does not panic
        publish_outputs(&c, data.path(), tmp.path());
        assert!(!data.path().join("never-made.txt").exists());
    }
}
