use env_logger::Builder;
use log::{Level, LevelFilter};
use std::io::Write;

/// Initialize logging with the defaults shared by tlspeer binaries.
///
/// Level defaults to WARN and can be set with RUST_LOG. Setting
/// RUST_LOG_FORMAT=SYSTEMD switches to a syslog-friendly format.
pub fn init() {
    init_with_info_modules(vec![])
}

/// Like [init], but log the given modules at INFO by default.
///
/// RUST_LOG still takes precedence.
pub fn init_with_info_modules(info_modules: Vec<&str>) {
    let systemd = std::env::var("RUST_LOG_FORMAT").is_ok_and(|f| f == "SYSTEMD");
    let mut builder = builder(&info_modules, systemd);
    builder.parse_default_env();

    // Tests and embedders may already have installed a logger.
    if let Err(err) = builder.try_init() {
        log::debug!("logger already initialized: {err}");
    }
}

fn builder(info_modules: &[&str], systemd: bool) -> Builder {
    let mut builder = Builder::new();
    if systemd {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "<{}>{}: {}",
                syslog_priority(record.level()),
                record.target(),
                record.args()
            )
        });
    }
    builder.filter_level(LevelFilter::Warn);
    for module in info_modules {
        builder.filter_module(module, LevelFilter::Info);
    }

    builder
}

/// Syslog priority of a log level (RFC 5424).
///
/// Timestamps are left out of the systemd format, since journald
/// records them anyway.
fn syslog_priority(level: Level) -> u8 {
    match level {
        Level::Error => 3,
        Level::Warn => 4,
        Level::Info => 5,
        Level::Debug | Level::Trace => 7,
    }
}
