extern crate photopipe;
extern crate structopt;

use photopipe::imagery::*;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "imagery")]
/// Check that Mapillary API access is configured. The token is read from MAPILLARY_ACCESS_TOKEN,
/// optionally set in a .env file.
struct Opt {
    /// API root to use instead of the public Mapillary graph API.
    #[structopt(long = "base-url", default_value = "https://graph.mapillary.com")]
    base_url: String,
}

fn main() -> Result<(), photopipe::Error> {
    let opt = Opt::from_args();
    photopipe::init_logging();

    let credentials = match Credentials::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let client = MapillaryClient::with_base_url(&credentials, &opt.base_url)?;
    println!("Mapillary authentication configured for {}", client.base_url());

    Ok(())
}
