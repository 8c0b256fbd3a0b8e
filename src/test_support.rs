//! Idempotent `env_logger` bootstrap shared by every `#[cfg(test)]` module in
//! this crate, the same pattern `rks`'s own test suite uses.

use std::sync::Once;

static INIT: Once = Once::new();

pub(crate) fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .is_test(true)
            .try_init()
            .ok();
    });
}
