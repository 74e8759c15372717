use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Logs go to stderr: stdout is the IPC channel.
///
/// `SMAPNAD_LOG` takes precedence over `RUST_LOG`; the default level is `info`.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_env("SMAPNAD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
