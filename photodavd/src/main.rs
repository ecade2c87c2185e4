mod daemon;
mod scheduler;
mod session;
mod sync;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--logout") => {
            session::SessionStore::open_default()?.clear()?;
            println!("session cleared");
            Ok(())
        }
        Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            eprintln!("unknown argument: {other}");
            print_usage();
            std::process::exit(2);
        }
        None => daemon::run().await,
    }
}

fn print_usage() {
    println!(
        "photodavd - WebDAV media sync daemon

USAGE:
    photodavd [--logout | --help]

With no arguments the daemon starts, using the session from
PHOTODAV_SERVER_URL / PHOTODAV_LOGIN / PHOTODAV_PASSWORD or the stored
session file.

OPTIONS:
    --logout    remove the stored session file and exit
    --help      show this help"
    );
}
