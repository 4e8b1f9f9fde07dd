//! `hsx-exec`: boot the executive and serve the control endpoint.

use std::net::TcpListener;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::unbounded;
use log::{error, info};

use hsx_exec::exec::{ExecConfig, ExecMsg, Executive};
use hsx_exec::persist::MemStore;
use hsx_exec::time::SystemClock;

#[derive(Parser)]
#[command(
    name = "hsx-exec",
    about = "HSX executive: MiniVM task scheduler with a JSON/TCP control endpoint"
)]
struct Opts {
    /// Control endpoint address.
    #[arg(long, default_value = "127.0.0.1:7332")]
    listen: String,

    /// `.hxe` images to load at boot.
    #[arg(long = "load", value_name = "IMAGE.hxe")]
    load: Vec<PathBuf>,

    /// Free-run the clock at this many rotations per second
    /// (0 = advance only on clock.step RPCs).
    #[arg(long, default_value_t = 0)]
    step_hz: u32,

    /// Arena size in bytes.
    #[arg(long, default_value_t = hsx_abi::DEFAULT_ARENA_BYTES)]
    arena_bytes: usize,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Opts::parse();

    let cfg = ExecConfig {
        arena_bytes: opts.arena_bytes,
        ..ExecConfig::default()
    };
    let mut exec = Executive::new(cfg, Box::new(SystemClock::new()), Box::new(MemStore::new()));

    for path in &opts.load {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("cannot read {}: {e}", path.display());
                std::process::exit(1);
            }
        };
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "app".to_string());
        if let Err(e) = exec.load_image(&bytes, &name, &path.display().to_string()) {
            error!("loading {} failed: {e}", path.display());
            std::process::exit(1);
        }
    }
    exec.hydrate_persisted();

    let listener = match TcpListener::bind(&opts.listen) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind {}: {e}", opts.listen);
            std::process::exit(1);
        }
    };

    let (tx, rx) = unbounded::<ExecMsg>();
    let sessions = exec.sessions_handle();

    if opts.step_hz > 0 {
        let interval = Duration::from_micros(1_000_000 / opts.step_hz as u64);
        let tick_tx = tx.clone();
        thread::spawn(move || {
            loop {
                thread::sleep(interval);
                if tick_tx.send(ExecMsg::Tick { rotations: 1 }).is_err() {
                    break;
                }
            }
        });
        info!("free-running at {} rotations/s", opts.step_hz);
    }

    let endpoint_tx = tx.clone();
    thread::spawn(move || hsx_exec::endpoint::serve(listener, endpoint_tx, sessions));

    exec.run(rx);
}
