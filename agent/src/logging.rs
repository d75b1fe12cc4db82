//! Log backend selection.
//!
//! Android has no stderr worth reading, so there every record goes to
//! logcat under [`LOG_TAG`]. Elsewhere (host tests, benches) `env_logger`
//! takes over and `RUST_LOG` sets the verbosity.

#[cfg(target_os = "android")]
use crate::config::LOG_TAG;

#[cfg(target_os = "android")]
mod logcat {
    use super::LOG_TAG;
    use core::ffi::{c_char, c_int};
    use log::{Level, Log, Metadata, Record};
    use std::ffi::CString;

    #[link(name = "log")]
    extern "C" {
        fn __android_log_write(prio: c_int, tag: *const c_char, text: *const c_char) -> c_int;
    }

    // android_LogPriority
    fn priority(level: Level) -> c_int {
        match level {
            Level::Trace => 2,
            Level::Debug => 3,
            Level::Info => 4,
            Level::Warn => 5,
            Level::Error => 6,
        }
    }

    pub(super) struct Logcat;

    impl Log for Logcat {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let (Ok(tag), Ok(text)) = (CString::new(LOG_TAG), CString::new(record.args().to_string()))
            else {
                return;
            };
            unsafe {
                __android_log_write(priority(record.level()), tag.as_ptr(), text.as_ptr());
            }
        }

        fn flush(&self) {}
    }
}

/// Install the logger. Later calls are no-ops.
pub fn init() {
    #[cfg(target_os = "android")]
    {
        static LOGGER: logcat::Logcat = logcat::Logcat;
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Debug);
        }
    }

    #[cfg(not(target_os = "android"))]
    {
        let _ = env_logger::try_init();
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_repeatable() {
        super::init();
        super::init();
        log::debug!("logger still usable");
    }
}
