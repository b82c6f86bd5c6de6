use clap::{command, Parser};
use jamlink::common::box_error::BoxError;
use jamlink::server::room;
use log::info;
use std::process::exit;
use std::sync::mpsc;
use std::thread;

#[derive(Parser)]
#[command(version, about = "jamlink mixing room server", long_about = None)]
struct Args {
    /// dump the effective settings.json path and exit
    #[arg(short, long, default_value_t = false)]
    check_config: bool,
}

fn main() -> Result<(), BoxError> {
    // Turn on the logger
    env_logger::init();

    let args = Args::parse();
    if args.check_config {
        let config = jamlink::common::config::Config::build();
        println!("{}", config.get_filename());
        exit(0);
    }

    // status snapshots from the room get logged here
    let (status_tx, status_rx) = mpsc::channel::<serde_json::Value>();
    let _status_handle = thread::spawn(move || {
        while let Ok(status) = status_rx.recv() {
            info!("room status: {}", status);
        }
    });

    room::run(status_tx)?;
    Ok(())
}
