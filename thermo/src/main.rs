mod host;
mod radio;
mod server;
mod simulated;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
