extern crate photopipe;
extern crate structopt;

use photopipe::equirect::*;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "preprocess")]
/// Split 360° equirectangular panoramas into front, right, back and left views. Other images are
/// copied unchanged.
struct Opt {
    /// Directory with .jpg, .jpeg or .png images.
    #[structopt(name = "INPUT_DIR", parse(from_os_str))]
    input_dir: std::path::PathBuf,

    /// Directory to write images to. Created if missing.
    #[structopt(name = "OUTPUT_DIR", parse(from_os_str))]
    output_dir: std::path::PathBuf,

    #[structopt(short = "v", long = "verbose")]
    verbose: bool,
}

fn main() -> Result<(), photopipe::Error> {
    let opt = Opt::from_args();
    photopipe::init_logging();

    let report = process_directory_verbose(&opt.input_dir, &opt.output_dir, opt.verbose)?;
    println!("{}", report);

    if !report.failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
