mod alternator;
mod control;
mod host;
mod mqtt;
mod outputs;
mod relays;
mod sampler;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
