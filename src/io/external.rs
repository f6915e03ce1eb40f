use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
#[cfg(unix)]
use std::os::unix::process::CommandExt;

use bevy::log::{debug, warn};
use tempfile::TempPath;
use wait_timeout::ChildExt;

use crate::{
    error::{TilingError, TilingResult},
    gaussian::splat_set::SplatSet,
    io::{
        codec::CodecBackend,
        ply::{parse_ply_file, write_ply_file},
    },
    job::settings::ExternalCodecCommand,
};


/// Bridges to a codec executable speaking
/// `<program> <args...> compress|decompress <source> <dest>`.
///
/// Splats cross the process boundary as binary ply files placed in a
/// temporary exchange location that is removed on every exit path.
#[derive(Clone, Debug)]
pub struct ExternalProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    exchange_dir: Option<PathBuf>,
}

impl ExternalProcessBackend {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            exchange_dir: None,
        }
    }

    /// Resolves the configured program on the search path.
    pub fn locate(command: &ExternalCodecCommand, timeout_secs: u64) -> Option<Self> {
        match which::which(&command.program) {
            Ok(program) => Some(Self::new(program, command.args.clone(), timeout_secs)),
            Err(err) => {
                debug!(program = %command.program, "external codec not found: {err}");
                None
            }
        }
    }

    pub fn with_exchange_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.exchange_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn exchange_path(&self) -> TilingResult<TempPath> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("splat-exchange-").suffix(".ply");

        let file = match &self.exchange_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }?;

        Ok(file.into_temp_path())
    }

    fn run(&self, verb: &str, source: &Path, dest: &Path) -> TilingResult<()> {
        debug!(
            program = %self.program.display(),
            verb,
            source = %source.display(),
            dest = %dest.display(),
            "invoking external codec"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(verb)
            .arg(source)
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // own group, so a timeout also reaches interpreters and their children
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => TilingError::CodecUnavailable,
                _ => TilingError::CodecProcessFailed {
                    stderr: format!("failed to spawn {}: {err}", self.program.display()),
                },
            })?;

        // drained on a thread so a chatty child cannot fill the pipe and stall
        let stderr = child.stderr.take();
        let stderr_pump = thread::spawn(move || {
            let mut captured = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut captured);
            }
            captured
        });

        match child.wait_timeout(self.timeout)? {
            Some(status) if status.success() => {
                let _ = stderr_pump.join();
                Ok(())
            }
            Some(status) => {
                let stderr = stderr_pump.join().unwrap_or_default();
                Err(TilingError::CodecProcessFailed {
                    stderr: format!("{verb} exited with {status}: {}", stderr.trim()),
                })
            }
            None => {
                terminate_process_group(child.id());
                let _ = child.kill();
                let _ = child.wait();
                // a straggler still holding stderr must not stretch the timeout
                drop(stderr_pump);

                warn!(program = %self.program.display(), verb, "external codec timed out");
                Err(TilingError::CodecTimeout {
                    seconds: self.timeout.as_secs(),
                })
            }
        }
    }
}

impl CodecBackend for ExternalProcessBackend {
    fn name(&self) -> &'static str {
        "external_process"
    }

    fn compress(&self, splats: &SplatSet, dest: &Path) -> TilingResult<()> {
        let exchange = self.exchange_path()?;
        write_ply_file(splats, &exchange)?;

        self.run("compress", &exchange, dest)?;

        if !dest.is_file() {
            return Err(TilingError::CodecProcessFailed {
                stderr: format!("compress produced no output at {}", dest.display()),
            });
        }

        Ok(())
    }

    fn decompress(&self, source: &Path) -> TilingResult<SplatSet> {
        let declared = declared_shape(source);
        let exchange = self.exchange_path()?;

        self.run("decompress", source, &exchange)?;
        let splats = parse_ply_file(&exchange)?;

        if let Some((count, sh_degree)) = declared {
            if splats.count() != count || splats.sh_degree() != sh_degree {
                return Err(TilingError::malformed(format!(
                    "codec returned {} splats of degree {}, header declares {count} of degree {sh_degree}",
                    splats.count(),
                    splats.sh_degree(),
                )));
            }
        }

        Ok(splats)
    }
}


#[cfg(unix)]
fn terminate_process_group(group_leader_pid: u32) {
    if group_leader_pid == 0 {
        return;
    }

    let _ = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{group_leader_pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn terminate_process_group(_group_leader_pid: u32) {}


/// Count and degree from the packed header, when the file is one we can read.
#[cfg(feature = "io_spz")]
fn declared_shape(source: &Path) -> Option<(u32, i32)> {
    match crate::io::spz::read_header(source) {
        Ok(header) => Some((header.num_points, header.sh_degree as i32)),
        Err(err) => {
            debug!(source = %source.display(), "packed header unreadable, skipping shape check: {err}");
            None
        }
    }
}

#[cfg(not(feature = "io_spz"))]
fn declared_shape(_source: &Path) -> Option<(u32, i32)> {
    None
}
