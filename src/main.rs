use server_proxy::config::AppConfig;
use server_proxy::error::Result;
use server_proxy::server::Server;
use proxy_log::info;

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = AppConfig::load(&config_path)?;
    config.display_config();

    info!("starting with {} worker(s)", config.params.workers);
    let server = Server::new(config)?;
    server.run()
}
