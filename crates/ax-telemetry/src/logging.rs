use tracing_subscriber::{fmt, EnvFilter};

/// Initialize console logging.
///
/// Filter resolution order: `RUST_LOG` if set, else `LOG_LEVEL`
/// (TRACE/DEBUG/INFO/WARN/ERROR/FATAL, case-insensitive; FATAL maps to
/// error), else `default_level`. Setting `SILENT` suppresses console output
/// entirely; the event log is unaffected.
///
/// Safe to call multiple times (e.g. in tests) -- subsequent calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    let fallback = std::env::var("LOG_LEVEL")
        .ok()
        .map(|lvl| normalize_level(&lvl).to_string())
        .unwrap_or_else(|| default_level.to_string());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&fallback));

    if std::env::var_os("SILENT").is_some() {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::sink)
            .try_init()
            .ok();
        return;
    }

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised");
}

/// Map a `LOG_LEVEL` value onto a tracing level directive.
fn normalize_level(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" => "warn",
        // tracing has no fatal level; treat it as error.
        "ERROR" | "FATAL" => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_normalisation() {
        assert_eq!(normalize_level("trace"), "trace");
        assert_eq!(normalize_level("FATAL"), "error");
        assert_eq!(normalize_level("Warn"), "warn");
        assert_eq!(normalize_level("bogus"), "info");
    }

    #[test]
    fn init_is_idempotent() {
        init_logging("test", "debug");
        init_logging("test", "debug");
    }
}
