use std::time::Duration;

use ca_client::{
    client::{Context, RequestType},
    dbr::DbrType,
};
use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
struct Options {
    /// PV names to read
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Seconds to wait for channels to connect and values to arrive
    #[clap(short = 'w', default_value_t = 1.0)]
    wait: f32,
    /// Request a specific DBR type, e.g. DBR_TIME_DOUBLE
    #[clap(short = 'd', value_parser = parse_dbr_type)]
    dbr_type: Option<DbrType>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_dbr_type(name: &str) -> Result<DbrType, String> {
    name.parse()
        .map_err(|_| format!("'{name}' is not a DBR type name"))
}

fn main() {
    let opts = Options::parse();

    tracing_subscriber::fmt()
        .with_max_level(match opts.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        })
        .init();

    let timeout = Duration::from_secs_f32(opts.wait);
    let request = opts.dbr_type.map(RequestType::from).unwrap_or_default();
    let context = Context::new().unwrap();
    let channels: Vec<_> = opts
        .names
        .iter()
        .map(|name| context.create_channel(name).unwrap())
        .collect();
    // Channels that did not connect are reported individually below
    let _ = context.pend_io(timeout);

    let mut failed = false;
    for channel in &channels {
        let result = channel
            .get(request)
            .and_then(|pending| pending.wait(timeout));
        match result {
            Ok(dbr) => println!("{:<30} {}", channel.name(), dbr.value()),
            Err(e) => {
                failed = true;
                println!("{:<30} *** {e}", channel.name());
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
}
