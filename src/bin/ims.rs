use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, exit};

/// Prefer the `imagesmith` binary installed next to this one, falling back to `PATH`.
fn imagesmith_program() -> PathBuf {
    let sibling = env::current_exe().ok().and_then(|exe| {
        let name = format!("imagesmith{}", env::consts::EXE_SUFFIX);
        exe.parent().map(|dir| dir.join(name))
    });
    match sibling {
        Some(path) if path.is_file() => path,
        _ => PathBuf::from("imagesmith"),
    }
}

fn main() {
    let args: Vec<OsString> = env::args_os().skip(1).collect();

    match Command::new(imagesmith_program()).args(&args).status() {
        Ok(status) => exit(status.code().unwrap_or(1)),
        Err(err) => {
            eprintln!("Failed to invoke imagesmith: {err}");
            exit(1);
        }
    }
}
