//! Standalone Local Mediator
//!
//! Serves the relay contract on the local network so devices can sign
//! without internet access. Peers find it through the advertised service
//! name and talk to it exactly as they would to the public relay.

use std::sync::Arc;

use keysign_core::{
    config::Settings,
    relay::{LocalMediator, MdnsAdvertiser},
    telemetry,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let settings = Settings::from_env();
    telemetry::init_tracing(settings.log_format());

    if let Err(message) = settings.validate() {
        tracing::error!("{message}");
        std::process::exit(1);
    }

    let mediator = LocalMediator::new(
        settings.mediator_addr(),
        Arc::new(MdnsAdvertiser::default()),
    );
    let service_name = LocalMediator::service_name(settings.service_prefix());

    let addr = match mediator.start(&service_name).await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start mediator");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, service = %service_name, "Mediator ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down mediator");
    mediator.stop().await;

    telemetry::shutdown_tracing();
    Ok(())
}
