use small_je::{utils, EnvConfig, Environment};
use tempfile::TempDir;

/// # Conduct the initialization
///
/// - Setting up log configurations.
pub fn setup() {
    utils::init_log();
}

/// A config with tiny nodes, so a few dozen records already make a
/// tree of several levels.
pub fn small_config(home: &std::path::Path) -> EnvConfig {
    EnvConfig::new(home)
        .with_bin_max_entries(4)
        .with_in_max_entries(4)
        .with_lock_timeout_ms(200)
}

/// Open an environment in a fresh temporary directory. The directory
/// is removed when the returned `TempDir` is dropped, keep it alive as
/// long as the environment.
pub fn new_env() -> (TempDir, Environment) {
    new_env_with(|config| config)
}

pub fn new_env_with(adjust: impl FnOnce(EnvConfig) -> EnvConfig) -> (TempDir, Environment) {
    let dir = tempfile::tempdir().unwrap();
    let config = adjust(small_config(dir.path()));
    let env = Environment::open(config).unwrap();
    (dir, env)
}

/// Drop the environment without closing it, which is what a crash
/// leaves behind, and open it again.
///
/// Every `Database` handle of the old environment must be dropped
/// before, otherwise the old environment stays alive.
pub fn crash_and_reopen(env: Environment) -> Environment {
    let config = env.config().clone();
    drop(env);
    Environment::open(config).unwrap()
}
