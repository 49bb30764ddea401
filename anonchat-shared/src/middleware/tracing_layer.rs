use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default directive set: info everywhere, debug for the service crate itself.
///
/// Package names use dashes while tracing targets use the crate path, so
/// `anonchat-matching` becomes `anonchat_matching`.
pub fn default_directives(service_name: &str) -> String {
    let target = service_name.replace('-', "_");
    format!("info,{target}=debug,anonchat_shared=debug,tower_http=debug")
}

pub fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(service_name)));

    let is_production = std::env::var("ANONCHAT_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);

    // `try_init` so a second call (tests, embedded use) keeps the first subscriber.
    let result = if is_production {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    };

    if result.is_ok() {
        tracing::info!(service = service_name, production = is_production, "tracing initialized");
    }
}
