use std::future::Future;

#[cfg(target_os = "linux")]
use monoio::IoUringDriver;
use monoio::{time::TimeDriver, LegacyDriver, Runtime, RuntimeBuilder};

use crate::config::RuntimeConfig;

/// Wraps the two `monoio` driver flavors behind one `block_on` entry point
/// so a worker thread doesn't need to know which one it ended up with.
pub enum RuntimeWrapper {
    #[cfg(target_os = "linux")]
    IoUring(Runtime<TimeDriver<IoUringDriver>>),
    Legacy(Runtime<TimeDriver<LegacyDriver>>),
}

impl From<&RuntimeConfig> for RuntimeWrapper {
    fn from(config: &RuntimeConfig) -> Self {
        #[cfg(target_os = "linux")]
        {
            if monoio::utils::detect_uring() {
                let runtime = RuntimeBuilder::<monoio::IoUringDriver>::new()
                    .enable_timer()
                    .with_entries(config.entries)
                    .build()
                    .expect("failed to build io_uring runtime");
                return RuntimeWrapper::IoUring(runtime);
            }
        }
        let _ = config;
        let runtime = RuntimeBuilder::<monoio::LegacyDriver>::new()
            .enable_timer()
            .build()
            .expect("failed to build legacy runtime");
        RuntimeWrapper::Legacy(runtime)
    }
}

impl RuntimeWrapper {
    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: Future,
    {
        match self {
            #[cfg(target_os = "linux")]
            RuntimeWrapper::IoUring(driver) => driver.block_on(future),
            RuntimeWrapper::Legacy(driver) => driver.block_on(future),
        }
    }
}
