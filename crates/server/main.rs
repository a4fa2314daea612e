use courier_amqp::redact;
use courier_server::{init_logging, Server, ServerConfig};

#[tokio::main]
async fn main() {
    let config = match ServerConfig::from_env().and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("courier-server: {}", e);
            std::process::exit(2);
        }
    };
    init_logging(config.log_json);

    tracing::info!(amqp = %redact(&config.amqp_uri), "Starting courier server");
    if let Err(e) = Server::new(config).run().await {
        tracing::error!(error = %e, "Courier server exited with error");
        std::process::exit(1);
    }
}
