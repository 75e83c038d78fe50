use std::path::PathBuf;

use clap::Parser;
use ninep::{io_err, server, session};

mod fs;
mod utils;

use crate::fs::ExportFs;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,
}

async fn expfs_main(Cli { address, exportdir }: Cli) -> ninep::Result<i32> {
    let root = tokio::fs::canonicalize(&exportdir).await?;
    if !tokio::fs::metadata(&root).await?.is_dir() {
        return Err(From::from(io_err!(
            InvalidInput,
            "export root must be a directory"
        )));
    }

    println!("[*] Exporting {:?}", root);
    println!("[*] Ready to accept clients: {}", address);

    server::serve(&address, move || {
        session::dispatch(ExportFs::new(root.clone()))
    })
    .await
    .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = expfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
