use std::env;

fn show_backtrace() -> bool {
    log::max_level() >= log::LevelFilter::Debug
        || env::var("RUST_BACKTRACE").is_ok_and(|value| value == "1")
}

/// Log a fatal error with its chain of causes, on one line unless debugging.
pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{e:?}");
    } else {
        log::error!("{e:#}");
    }
}
