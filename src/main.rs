use dns_minimiser::config::Config;
use dns_minimiser::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = Config::load()?;
    dns_minimiser::run(config).await
}
