use miette::Result;
#[cfg(unix)]
use miette::IntoDiagnostic;

/// Detaches from the controlling terminal with the usual double fork and
/// points stdin, stdout and stderr at `/dev/null`.
///
/// Must run before the tokio runtime or any other thread is started.
#[cfg(unix)]
pub fn daemonize() -> Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    fork_and_exit_parent()?;

    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error()).into_diagnostic();
    }

    fork_and_exit_parent()?;

    let dev_null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .into_diagnostic()?;
    let null_fd = dev_null.as_raw_fd();
    for fd in 0..=2 {
        if unsafe { libc::dup2(null_fd, fd) } == -1 {
            return Err(std::io::Error::last_os_error()).into_diagnostic();
        }
    }

    Ok(())
}

#[cfg(unix)]
fn fork_and_exit_parent() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()).into_diagnostic(),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}

#[cfg(not(unix))]
pub fn daemonize() -> Result<()> {
    Err(miette::miette!("daemon mode is only supported on unix, run with --foreground"))
}

