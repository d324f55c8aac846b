use actix_web::HttpResponse;
use http::StatusCode;
use std::path::Path;
use tracing_subscriber::{fmt, EnvFilter};

/// True for `1`, `true`, `yes` or `on` (any case).
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Read a boolean environment variable; unset means `None`.
pub fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_flag(&v))
}

/// Read a trimmed, non-empty environment variable.
pub fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse::<T>().ok())
}

fn load_env_file() -> String {
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Some(p) = env_string(key) {
            if Path::new(&p).is_file() && dotenvy::from_filename(&p).is_ok() {
                return format!("{p} ({key})");
            }
        }
    }
    if Path::new(".envfile").is_file() && dotenvy::from_filename(".envfile").is_ok() {
        return ".envfile".into();
    }
    if dotenvy::dotenv().is_ok() {
        return ".env".into();
    }
    // Walk up from the executable's directory.
    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent();
        while let Some(d) = dir {
            let candidate = d.join(".env");
            if candidate.is_file() && dotenvy::from_filename(&candidate).is_ok() {
                return candidate.display().to_string();
            }
            dir = d.parent();
        }
    }
    "none".into()
}

/// Load dotenv files and install the global fmt subscriber.
///
/// Search order: `ENV_FILE`, `ENVFILE`, `DOTENV_PATH`, `./.envfile`, `./.env`,
/// then `.env` in the executable's ancestors. The filter comes from `RUST_LOG`
/// (default `info`).
pub fn init_tracing() {
    let env_source = load_env_file();
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    tracing::info!(source = %env_source, "environment loaded");
}

/// Bind address from `RELAYIUM_BIND_ADDR`, default 0.0.0.0:8088.
pub fn env_bind_addr() -> String {
    env_string("RELAYIUM_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8088".into())
}

/// Shared upstream HTTP client.
///
/// - `RELAYIUM_HTTP_TIMEOUT_SECONDS`: whole-request timeout
/// - `RELAYIUM_CONNECT_TIMEOUT_SECONDS`: connect timeout
/// - `RELAYIUM_NO_PROXY`: ignore every proxy setting
/// - `RELAYIUM_PROXY_URL`, `HTTP_PROXY`, `HTTPS_PROXY`: proxies
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if let Some(n) = env_parse::<u64>("RELAYIUM_HTTP_TIMEOUT_SECONDS") {
        builder = builder.timeout(std::time::Duration::from_secs(n));
    }
    if let Some(n) = env_parse::<u64>("RELAYIUM_CONNECT_TIMEOUT_SECONDS") {
        builder = builder.connect_timeout(std::time::Duration::from_secs(n));
    }

    if env_flag("RELAYIUM_NO_PROXY").unwrap_or(false) {
        builder = builder.no_proxy();
    } else {
        if let Some(u) = env_string("RELAYIUM_PROXY_URL") {
            match reqwest::Proxy::all(&u) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => tracing::warn!(error = %e, "ignoring RELAYIUM_PROXY_URL"),
            }
        }
        if let Some(u) = env_string("HTTP_PROXY").or_else(|| env_string("http_proxy")) {
            if let Ok(p) = reqwest::Proxy::http(&u) {
                builder = builder.proxy(p);
            }
        }
        if let Some(u) = env_string("HTTPS_PROXY").or_else(|| env_string("https_proxy")) {
            if let Ok(p) = reqwest::Proxy::https(&u) {
                builder = builder.proxy(p);
            }
        }
    }

    builder = builder.user_agent(format!("relayium/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default HTTP client");
        reqwest::Client::new()
    })
}

/// JSON error body in the canonical `{"error":{...}}` shape.
pub fn error_response(status: StatusCode, error_type: &str, msg: &str) -> HttpResponse {
    let body = serde_json::json!({
        "error": { "message": msg, "type": error_type, "param": null, "code": null }
    });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

/// CORS from `CORS_ALLOWED_ORIGINS`, `CORS_ALLOWED_METHODS`,
/// `CORS_ALLOWED_HEADERS`, `CORS_ALLOW_CREDENTIALS` and `CORS_MAX_AGE`.
/// Unset lists allow anything.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match env_string("CORS_ALLOWED_ORIGINS") {
        Some(s) if s != "*" => {
            for origin in csv(&s) {
                cors = cors.allowed_origin(&origin);
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match env_string("CORS_ALLOWED_METHODS") {
        Some(s) if s != "*" => {
            let methods = csv(&s);
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods.iter().map(|m| m.as_str()));
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match env_string("CORS_ALLOWED_HEADERS") {
        Some(s) if s != "*" => {
            for h in csv(&s) {
                cors = cors.allowed_header(h.as_str());
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if env_flag("CORS_ALLOW_CREDENTIALS").unwrap_or(false) {
        cors = cors.supports_credentials();
    }
    if let Some(n) = env_parse::<usize>("CORS_MAX_AGE") {
        cors = cors.max_age(n);
    }

    cors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_accept_common_truthy_spellings() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_flag(v), "{v}");
        }
        for v in ["0", "false", "off", "", "maybe"] {
            assert!(!parse_flag(v), "{v}");
        }
    }

    #[test]
    fn csv_skips_blanks() {
        assert_eq!(csv("a, ,b,"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn error_response_keeps_status() {
        let resp = error_response(StatusCode::UNAUTHORIZED, "invalid_request_error", "no token");
        assert_eq!(resp.status().as_u16(), 401);
    }
}
