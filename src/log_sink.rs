//! Borrowed logging sink.
//!
//! Conversions report progress and non-fatal problems to a caller supplied
//! [`log::Log`] instead of the process-wide logger, so two conversions running
//! side by side can be observed separately.

use std::fmt;

use log::{Level, Log, Metadata, Record};

const TARGET: &str = "kpf_repack";

/// Cheap copyable handle onto a [`Log`] implementation.
#[derive(Clone, Copy)]
pub struct LogSink<'a> {
    inner: &'a dyn Log,
}

impl<'a> LogSink<'a> {
    pub fn new(inner: &'a dyn Log) -> Self {
        Self { inner }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Debug, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Info, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Warn, args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Error, args);
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        let metadata = Metadata::builder().level(level).target(TARGET).build();
        if !self.inner.enabled(&metadata) {
            return;
        }
        self.inner.log(
            &Record::builder()
                .metadata(metadata)
                .args(args)
                .module_path_static(Some(module_path!()))
                .build(),
        );
    }
}

impl fmt::Debug for LogSink<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink")
    }
}
