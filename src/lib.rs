pub mod config;
pub mod grader;
pub mod language;
pub mod queue;
pub mod sandbox;
pub mod testing;
pub mod worker;

/// Installs the env_logger backend, defaulting to the `info` level
///
/// Safe to call more than once; only the first call has an effect.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("info"))
        .try_init();
}

