#![deny(unused_import_braces)]

#[macro_use] extern crate log;
extern crate clap;
extern crate env_logger;
extern crate libc;

extern crate fpgahost_bus as bus;
extern crate fpgahost_hw as hw;
extern crate fpgahost_input as input;
extern crate fpgahost_ui as ui;

mod app;
mod signal;

use app::Options;
use hw::{Fpga, FpgaConfig};
use hw::sim::SimRegs;

use std::env;
use std::path::PathBuf;
use std::process;
use std::str::FromStr;

fn parse_or_exit<T: FromStr>(args: &clap::ArgMatches, name: &str, default: T) -> T {
    match args.value_of(name) {
        None => default,
        Some(value) => match value.parse() {
            Ok(v) => v,
            Err(_) => {
                println!("error: invalid value for --{}: {}", name, value);
                process::exit(2);
            }
        },
    }
}

fn os_main() -> i32 {
    let args = clap::App::new("fpgahost")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Host controller for Cyclone V SoC FPGA boards")
        .arg(clap::Arg::with_name("core")
            .long("core")
            .value_name("RBF")
            .takes_value(true)
            .help("Bitstream to load at startup (relative to --root)"))
        .arg(clap::Arg::with_name("root")
            .long("root")
            .value_name("DIR")
            .takes_value(true)
            .help("Directory holding the cores [default: /media/fat]"))
        .arg(clap::Arg::with_name("input-dir")
            .long("input-dir")
            .value_name("DIR")
            .takes_value(true)
            .help("Where evdev nodes appear [default: /dev/input]"))
        .arg(clap::Arg::with_name("max-bitstream")
            .long("max-bitstream")
            .value_name("MiB")
            .takes_value(true)
            .help("Largest bitstream file accepted [default: 128]"))
        .arg(clap::Arg::with_name("queue-capacity")
            .long("queue-capacity")
            .value_name("N")
            .takes_value(true)
            .help("Messages the event bus queues before refusing more [default: 1024]"))
        .arg(clap::Arg::with_name("translator")
            .short("T")
            .long("translator")
            .takes_value(true)
            .help("How keyboard input reaches the core"))
        .arg(clap::Arg::with_name("no-hotplug")
            .long("no-hotplug")
            .help("Only use the input devices present at startup"))
        .arg(clap::Arg::with_name("simulate")
            .long("simulate")
            .help("Run against a simulated FPGA instead of /dev/mem"))
        .get_matches();

    let translator = args.value_of("translator").unwrap_or(ui::translator::DEFAULT_TRANSLATOR);
    let make_translator = match ui::translator::TRANSLATOR_MAP.get(translator) {
        Some(&make) => make,
        None => {
            println!("error: unknown translator: {}", translator);
            println!("{} translators known:", ui::translator::TRANSLATOR_MAP.len());
            for name in ui::translator::TRANSLATOR_MAP.keys() {
                println!("\t{}", name);
            }
            return 2;
        }
    };

    let max_mib: u64 = parse_or_exit(&args, "max-bitstream", hw::fpga::DEFAULT_MAX_BITSTREAM >> 20);
    let fpga_config = FpgaConfig {
        max_bitstream_size: max_mib << 20,
        ..FpgaConfig::default()
    };

    let options = Options {
        core: args.value_of("core").map(PathBuf::from),
        root: PathBuf::from(args.value_of("root").unwrap_or("/media/fat")),
        input_dir: PathBuf::from(args.value_of("input-dir").unwrap_or("/dev/input")),
        queue_capacity: parse_or_exit(&args, "queue-capacity", 1024),
        hotplug: !args.is_present("no-hotplug"),
        translator: make_translator,
    };

    signal::install();

    let result = if args.is_present("simulate") {
        info!("using a simulated FPGA");
        app::run(Fpga::new(SimRegs::new(), fpga_config), options)
    } else {
        match Fpga::initialize(fpga_config) {
            Ok(fpga) => app::run(fpga, options),
            Err(e) => {
                error!("{}", e);
                return 1;
            }
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

fn main() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "fpgahost=info");
    }
    env_logger::init();

    process::exit(os_main());
}
