#[tokio::main]
async fn main() {
    if let Err(err) = ai_daemon_client::run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
