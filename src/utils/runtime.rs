use std::process;

/// Signal handling and the socket model assume a POSIX host.
pub fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: ppp-broker runs on POSIX systems only");
        process::exit(2);
    }
}

/// Prints `<stage> error: <err>` and exits with status 2.
pub fn exit_on_startup_error(stage: &str, error: impl std::fmt::Display) -> ! {
    eprintln!("{stage} error: {error}");
    process::exit(2);
}
