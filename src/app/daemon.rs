use std::fs;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use super::Instance;

/// Set in the environment of the background child so it knows the detach
/// step already happened.
pub const DETACHED_ENV: &str = "MOLE_DETACHED";

/// Carries the claimed instance id to the background child, which would
/// otherwise generate a fresh one.
pub const DETACHED_ID_ENV: &str = "MOLE_INSTANCE_ID";

/// Whether this process is the background child of a detach step.
pub fn running_detached() -> bool {
    std::env::var_os(DETACHED_ENV).is_some()
}

/// The instance id handed down by the detaching parent, if any.
pub fn detached_id() -> Option<String> {
    std::env::var(DETACHED_ID_ENV).ok()
}

/// Re-exec the current invocation in the background: same binary, same
/// arguments, output redirected to the instance log file.
///
/// The child's pid replaces ours in the instance pid file so `stop`
/// signals the right process. The caller (the foreground parent) exits
/// after this returns.
pub fn spawn_detached(instance: &Instance) -> Result<()> {
    let exe = std::env::current_exe().context("could not locate the current executable")?;

    let log = fs::File::create(&instance.log_file)
        .with_context(|| format!("could not create log file for instance {}", instance.id))?;
    let log_err = log
        .try_clone()
        .context("could not clone log file handle")?;

    let child = Command::new(exe)
        .args(std::env::args_os().skip(1))
        .env(DETACHED_ENV, "1")
        .env(DETACHED_ID_ENV, &instance.id)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .context("could not spawn the background instance")?;

    instance.write_pid(child.id())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_detached_reflects_environment() {
        // SAFETY: variable is process-local and test-scoped.
        unsafe { std::env::remove_var(DETACHED_ENV) };
        assert!(!running_detached());

        unsafe { std::env::set_var(DETACHED_ENV, "1") };
        assert!(running_detached());

        unsafe { std::env::remove_var(DETACHED_ENV) };
    }
}
