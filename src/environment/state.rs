use log::error;
use once_cell::sync::OnceCell;

use crate::{error::SmallError, types::SmallResult};

/// Validity of an environment. Once a fatal error is seen the
/// environment stays invalid, only a fresh open (which runs recovery)
/// gets a usable environment again.
#[derive(Debug, Default)]
pub struct EnvState {
    invalid: OnceCell<String>,
}

impl EnvState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self) -> SmallResult {
        match self.invalid.get() {
            Some(reason) => Err(SmallError::EnvironmentInvalid(reason.clone())),
            None => Ok(()),
        }
    }

    /// Mark the environment invalid. The first reason wins.
    pub fn invalidate(&self, err: &SmallError) {
        if self.invalid.set(err.to_string()).is_ok() {
            error!("environment invalidated: {}", err);
            err.show_backtrace();
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid.get().is_none()
    }

    pub fn reason(&self) -> Option<&str> {
        self.invalid.get().map(|s| s.as_str())
    }
}
