use clap::Parser;

use kv_repl::client::Client;
use kv_repl::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(name = "kv-repl-client", about = "Smoke-test client for the key-value server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> kv_repl::Result<()> {
    let args = Args::parse();

    let mut client = Client::connect((args.host.as_str(), args.port)).await?;

    let pong = client.ping().await?;
    println!("PING -> {}", pong);

    client.set("hello", "world".into()).await?;
    println!("SET hello world -> OK");

    match client.get("hello").await? {
        Some(value) => println!("GET hello -> {}", String::from_utf8_lossy(&value)),
        None => println!("GET hello -> (nil)"),
    }

    Ok(())
}
