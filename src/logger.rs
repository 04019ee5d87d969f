//! logger.rs
//! Configuración del logger usando env_logger.

use std::io::Write;

/// `RUST_LOG` manda; si no está, `info` (o `debug` con `debug = true`).
/// `LOG_FORMAT=json` emite una línea JSON por registro.
pub fn init_logger(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let log_env = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_env));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "ts": chrono::Utc::now().to_rfc3339(),
                "level": record.level().as_str(),
                "target": record.target(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        });
    } else {
        builder.format_timestamp_secs();
    }

    // try_init: los tests pueden inicializarlo más de una vez
    let _ = builder.try_init();
}
