mod events;

#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod file_sink;
#[cfg(not(feature = "esp32"))]
mod host;
#[cfg(feature = "esp32")]
mod partition;
#[cfg(any(feature = "esp32", test))]
mod socket;
#[cfg(not(feature = "esp32"))]
mod tcp;

#[cfg(not(feature = "esp32"))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}
