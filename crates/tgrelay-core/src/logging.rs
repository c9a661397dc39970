use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{errors::Error, Result};

/// Filter used when `RUST_LOG` is unset: this crate and the host service at info,
/// dependencies at warn.
pub fn default_directives(service_name: &str) -> String {
    let service = service_name.replace('-', "_");
    format!("warn,tgrelay_core=info,{service}=info")
}

/// Install a global fmt subscriber. Fails if one is already installed.
pub fn init(service_name: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(default_directives(service_name))
            .map_err(|e| Error::Config(format!("invalid log directives: {e}")))?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| Error::Config(format!("tracing subscriber already set: {e}")))
}
