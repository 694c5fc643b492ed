use std::{sync::mpsc, time::SystemTime};

use ca_client::{
    client::{ConnectionEvent, Context, RequestType},
    dbr::Dbr,
    messages::MonitorMask,
};
use clap::Parser;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
struct Options {
    /// PV names to monitor
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

enum Line {
    Connection(String, ConnectionEvent),
    Update(String, Dbr),
}

fn format_time(time: Option<SystemTime>) -> String {
    let Some(since) = time.and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok()) else {
        return "<undefined>".to_owned();
    };
    format!("{}.{:06}", since.as_secs(), since.subsec_micros())
}

fn main() {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default().add_directive(
        match opts.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        }
        .into(),
    );
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_filter(filter);
    tracing_subscriber::registry().with(fmt_layer).init();

    let context = Context::new().unwrap();
    let (lines, printer) = mpsc::channel();

    let mut channels = Vec::new();
    let mut subscriptions = Vec::new();
    for name in &opts.names {
        let connection_lines = lines.clone();
        let connection_name = name.clone();
        let channel = context
            .create_channel_with_callback(name, move |event| {
                let _ = connection_lines.send(Line::Connection(connection_name.clone(), event));
            })
            .unwrap();
        let update_lines = lines.clone();
        let update_name = name.clone();
        let subscription = channel
            .subscribe(
                RequestType::default(),
                MonitorMask::default(),
                move |update| {
                    // Disconnects are reported through the connection callback
                    if let Ok(dbr) = update {
                        let _ = update_lines.send(Line::Update(update_name.clone(), dbr));
                    }
                },
            )
            .unwrap();
        channels.push(channel);
        subscriptions.push(subscription);
    }
    drop(lines);
    context.flush_io();

    while let Ok(line) = printer.recv() {
        match line {
            Line::Connection(name, ConnectionEvent::Disconnected) => {
                println!("{name:<30} *** disconnected");
            }
            Line::Connection(name, ConnectionEvent::NotFound) => {
                println!("{name:<30} *** not found");
            }
            Line::Connection(name, ConnectionEvent::Connected { server, .. }) => {
                info!("{name} connected to {server}");
            }
            Line::Update(name, dbr) => {
                println!("{name:<30} {} {}", format_time(dbr.timestamp()), dbr.value());
            }
        }
    }
}
