extern crate photopipe;
extern crate structopt;

use photopipe::capture::*;
use photopipe::carla::CarlaSimulator;
use structopt::StructOpt;

use std::time::Duration;

#[derive(StructOpt, Debug)]
#[structopt(name = "capture")]
/// Drive a camera car around a CARLA town and save its images.
struct Opt {
    #[structopt(long = "host", default_value = "localhost")]
    host: String,

    #[structopt(long = "port", default_value = "2000")]
    port: u16,

    /// Seconds to wait for the simulator to answer.
    #[structopt(long = "timeout", default_value = "10")]
    timeout: f64,

    #[structopt(long = "map", default_value = "Town10HD_Opt")]
    map: String,

    /// Upper bound on the number of background vehicles.
    #[structopt(long = "vehicles", default_value = "50")]
    max_npcs: usize,

    /// Directory images are written to.
    #[structopt(long = "out", parse(from_os_str), default_value = "out")]
    output_dir: std::path::PathBuf,

    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

fn main() -> Result<(), photopipe::Error> {
    let opt = Opt::from_args();
    photopipe::init_logging();

    let interrupt = install_interrupt_handler()?;
    let mut sim = CarlaSimulator::connect(&opt.host, opt.port, Duration::from_secs_f64(opt.timeout))?;

    let config = CaptureConfig {
        map: opt.map,
        max_npcs: opt.max_npcs,
        output_dir: opt.output_dir,
        verbose: opt.verbose,
        ..CaptureConfig::default()
    };

    match run_capture(&mut sim, &config, &interrupt) {
        Ok(outcome) => {
            if outcome.interrupted {
                println!("Stopping early.");
            } else {
                println!("Reached target of {} images. Stopping.", outcome.target);
            }
            println!(
                "Captured {}/{} images. Cleaned up all actors.",
                outcome.captured, outcome.target
            );
            Ok(())
        }
        Err(photopipe::Error::Interrupted) => {
            println!("Stopping early. Cleaned up all actors.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
