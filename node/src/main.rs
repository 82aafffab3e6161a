use std::{io, process};

use log::{error, info};
use node::NodeConfig;
use tokio::{signal, task};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let config = NodeConfig::from_env()?;
    let rank = config.rank;
    info!(node = rank; "starting with {} nodes", config.nodes.len());

    let training = task::spawn_blocking(move || node::run(config));

    tokio::select! {
        ret = training => {
            match ret.map_err(io::Error::other)? {
                Ok(params) => info!(node = rank; "done, {} parameters", params.len()),
                Err(e) => {
                    error!(node = rank; "{e}");
                    return Err(e.into());
                }
            }
        }
        _ = signal::ctrl_c() => {
            // The runtime would otherwise wait on the blocking training task.
            info!("interrupted, aborting");
            process::exit(130);
        }
    }

    Ok(())
}
