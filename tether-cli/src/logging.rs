use tracing_subscriber::EnvFilter;

/// Log to stderr so stdout carries only the child's output.
/// `RUST_LOG` overrides the default filter.
pub fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("tether_cli=debug,tether_kernel=debug")
        } else {
            EnvFilter::new("tether_cli=info,tether_kernel=info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
