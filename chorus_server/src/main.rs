//! Chorus replication server executable.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use tokio::runtime::Builder;

use chorus::{
    logger_init, pf_error, pf_info, ChorusError, ReplServerConfig,
    ReplicationServer, ShutdownSignal, ME,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// TOML configuration file; defaults apply to anything it leaves out.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Replication server ID, overriding the config file's.
    #[arg(short, long)]
    id: Option<i32>,

    /// Listening address, overriding the config file's.
    #[arg(short, long)]
    listen: Option<String>,

    /// Identity prefixed to every log line; defaults to the server ID.
    #[arg(long)]
    log_id: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 16)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ChorusError)` on any error.
    fn sanitize(&self) -> Result<(), ChorusError> {
        if self.threads < 2 {
            return Err(ChorusError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        if let Some(id) = self.id {
            if id <= 0 {
                return Err(ChorusError::msg(format!("invalid id {}", id)));
            }
        }
        if let Some(listen) = self.listen.as_ref() {
            listen.parse::<SocketAddr>().map_err(|e| {
                ChorusError::msg(format!(
                    "invalid listen address '{}': {}",
                    listen, e
                ))
            })?;
        }
        Ok(())
    }

    /// Loads the config file, if any, and applies the overrides.
    fn server_config(&self) -> Result<ReplServerConfig, ChorusError> {
        let config_str = match self.config.as_ref() {
            Some(path) => Some(fs::read_to_string(path)?),
            None => None,
        };
        let mut config = ReplServerConfig::parse(config_str.as_deref())?;
        if let Some(id) = self.id {
            config.server_id = id;
        }
        if let Some(listen) = self.listen.as_ref() {
            config.listen_addr = listen.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Actual main function of the Chorus replication server.
fn server_main() -> Result<(), ChorusError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = args.server_config()?;

    let me = args
        .log_id
        .clone()
        .unwrap_or_else(|| format!("rs{}", config.server_id));
    let _ = ME.set(me);

    // set up termination signals handler
    let shutdown = ShutdownSignal::new();
    let shutdown_ctrlc = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_ctrlc.trigger("termination signal");
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-chorus")
            .build()?;

        // enter tokio runtime, set up the replication server, and run it
        // until termination
        runtime.block_on(async move {
            let server =
                ReplicationServer::new_and_setup(config, shutdown.clone())
                    .await?;
            server.run().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            match shutdown.reason() {
                Some(reason) if reason != "termination signal" => {
                    Err(ChorusError::msg(reason))
                }
                _ => Ok::<(), ChorusError>(()),
            }
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    pf_info!("replication server stopped");
    Ok(())
}

/// Main function of the Chorus replication server.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args() -> CliArgs {
        CliArgs {
            config: None,
            id: Some(3),
            listen: Some("127.0.0.1:48989".into()),
            log_id: None,
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), ChorusError> {
        args().sanitize()?;
        let config = args().server_config()?;
        assert_eq!(config.server_id, 3);
        assert_eq!(config.listen_addr, "127.0.0.1:48989");
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut args = args();
        args.threads = 1;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_id() {
        let mut args = args();
        args.id = Some(0);
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_listen() {
        let mut args = args();
        args.listen = Some("not-an-address".into());
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn config_file_missing() {
        let mut args = args();
        args.config = Some(PathBuf::from("/tmp/chorus-no-such-config.toml"));
        assert!(args.server_config().is_err());
    }
}
