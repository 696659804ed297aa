use tracing::{error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use netmux::commands::error_body;
use netmux::run_cni;

fn main() {
    // stdout belongs to the CNI result
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(Level::WARN)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run_cni() {
        error!("CNI plugin error: {}", err);
        println!("{}", error_body(&err));
        std::process::exit(1);
    }
}
