use env_logger::Env;

/// Initialize process-wide logging.
///
/// The filter is read from `EMBER_LOG` and defaults to `info`.
pub fn setup_logging() {
    env_logger::Builder::from_env(Env::default().filter_or("EMBER_LOG", "info"))
        .format_timestamp_millis()
        .init();
}
