// Shared CLI/logging plumbing for the demos under `demos/`. Mirrors the
// small getopts-based harness smoltcp-style example binaries use, trimmed to
// only the options `ping.rs` reaches for (a single `--tap <name>` device).

use std::env;

use getopts::{Matches, Options};
use log::{Level, LevelFilter};
use vortex_tun::phy::{Medium, TunTapInterface};

pub fn setup_logging(filter: &str) {
    let filter = filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Warn);
    env_logger::Builder::new()
        .filter_level(filter)
        .format(|buf, record| {
            use std::io::Write;
            let level = match record.level() {
                Level::Error => "ERROR",
                Level::Warn => "WARN",
                Level::Info => "INFO",
                Level::Debug => "DEBUG",
                Level::Trace => "TRACE",
            };
            writeln!(buf, "[{level}] {}", record.args())
        })
        .init();
}

pub fn create_options() -> (Options, Vec<String>) {
    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    let free = env::args().skip(1).collect();
    (opts, free)
}

pub fn add_tuntap_options(opts: &mut Options, _free: &mut Vec<String>) {
    opts.optopt("", "tap", "TAP interface to attach to or create", "NAME");
    opts.optopt("", "tun", "TUN interface to attach to or create", "NAME");
}

pub fn parse_options(opts: &Options, free: Vec<String>) -> Matches {
    match opts.parse(&free) {
        Ok(matches) => {
            if matches.opt_present("h") {
                print_usage(opts);
                std::process::exit(0);
            }
            matches
        }
        Err(err) => {
            eprintln!("{err}");
            print_usage(opts);
            std::process::exit(1);
        }
    }
}

fn print_usage(opts: &Options) {
    print!("{}", opts.usage("Usage: ping [options]"));
}

pub fn parse_tuntap_options(matches: &mut Matches) -> TunTapInterface {
    let (name, medium) = match (matches.opt_str("tap"), matches.opt_str("tun")) {
        (Some(name), None) => (name, Medium::Ethernet),
        (None, Some(name)) => (name, Medium::Ip),
        (None, None) => {
            eprintln!("one of --tap or --tun is required");
            std::process::exit(1);
        }
        (Some(_), Some(_)) => {
            eprintln!("--tap and --tun are mutually exclusive");
            std::process::exit(1);
        }
    };
    TunTapInterface::new(&name, medium).expect("failed to open tun/tap interface")
}
