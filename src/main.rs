use clap::Parser;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

use chainfs::{
    client::{Client, LocalFiles},
    config::{self, Settings},
};

const HELP: &str = "\
commands:
  store <file> [secret]     upload a file from the local directory
  retrieve <file> [secret]  download a file into the local directory
  listget                   list files held by the cluster
  listput                   list files in the local directory
  help                      show this text
  quit                      leave";

/// Interactive command-line client for the file store.
#[derive(Parser, Debug)]
#[command(name = "client")]
struct Args {
    /// The frontend's chain address.
    #[arg(long, default_value = "127.0.0.1:50000")]
    frontend: String,

    /// Where the frontend calls back.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: String,

    /// Local directory files are read from and written to.
    #[arg(long, default_value = ".")]
    dir: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::init_logging();
    config::log_chain_errors();
    let args = Args::parse();

    let client = Client::bind(&args.listen, args.frontend, Settings::default()).await?;
    let files = LocalFiles::new(args.dir);
    println!("{HELP}");

    let mut lines = BufReader::new(stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        let secret = words.get(2).copied().unwrap_or_default();

        match words.as_slice() {
            [] => continue,
            ["store", file, ..] => match files.read(file) {
                Ok(content) => match client.store(file, &content, secret).await {
                    Ok(()) => println!("stored {file}"),
                    Err(err) => println!("store failed: {err}"),
                },
                Err(err) => println!("cannot read {file}: {err}"),
            },
            ["retrieve", file, ..] => match client.retrieve(file, secret).await {
                Ok(content) if content.is_empty() => println!("{file} not found"),
                Ok(content) => match files.write(file, &content) {
                    Ok(()) => println!("retrieved {file}"),
                    Err(err) => println!("cannot write {file}: {err}"),
                },
                Err(err) => println!("retrieve failed: {err}"),
            },
            ["listget"] => match client.list().await {
                Ok(names) => println!("{}", names.join("\n")),
                Err(err) => println!("list failed: {err}"),
            },
            ["listput"] => match files.list() {
                Ok(names) => println!("{}", names.join("\n")),
                Err(err) => println!("cannot list {}: {err}", files.root().display()),
            },
            ["help"] => println!("{HELP}"),
            ["quit"] | ["exit"] => break,
            _ => println!("unknown command, try help"),
        }
    }

    Ok(())
}
