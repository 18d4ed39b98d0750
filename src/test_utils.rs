//! Test utilities shared by unit tests
//!
//! Config tests mutate process-wide environment variables, so they take a
//! global lock and restore the environment when done.

use std::collections::HashMap;
use std::env;
use std::sync::Mutex;

/// Global mutex to ensure all config-related tests run serially
pub static GLOBAL_CONFIG_TEST_LOCK: Mutex<()> = Mutex::new(());

const PREFIX: &str = "CATALOG_METRICS_";

/// Remove all `CATALOG_METRICS_` variables, returning their values
pub fn clean_env() -> HashMap<String, String> {
    let original: HashMap<String, String> = env::vars()
        .filter(|(key, _)| key.starts_with(PREFIX))
        .collect();
    for key in original.keys() {
        env::remove_var(key);
    }
    original
}

/// Restore the variables saved by [`clean_env`]
pub fn restore_env(original: HashMap<String, String>) {
    for (key, _) in env::vars() {
        if key.starts_with(PREFIX) {
            env::remove_var(&key);
        }
    }
    for (key, value) in original {
        env::set_var(key, value);
    }
}
