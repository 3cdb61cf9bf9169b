use anyhow::Result;

mod cli;
mod hidapi_impl;

#[tokio::main]
async fn main() -> Result<()> {
    cli::execute().await
}
