//! Wires the crates together and runs the main loop.
//!
//! The main thread owns the FPGA. Everything that wants the hardware (the dispatcher, mostly)
//! sends a `Command` here, so the configuration handshake never runs on the bus thread.

use signal;

use bus::{BusConfig, BusError, CoreInfo, EventBus, ObserverId, Payload, Task, EVENT_CORE_STARTED};
use hw::{ErrorClass, Fpga, RegisterIo};
use input::{DetectorConfig, DeviceDetector, DeviceRegistry, EvdevOpener, InputPoller};
use input::PollerConfig;
use ui::{Command, CommandDispatcher, CoreTranslator};
use ui::menu::{CoreListMenu, LogOsd};

use std::error::Error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

/// How often the main loop looks at the signal flag while idle.
const SIGNAL_CHECK: Duration = Duration::from_millis(100);

pub struct Options {
    /// Core to load before entering the main loop
    pub core: Option<PathBuf>,
    pub root: PathBuf,
    pub input_dir: PathBuf,
    pub queue_capacity: usize,
    pub hotplug: bool,
    pub translator: fn() -> Box<dyn CoreTranslator>,
}

/// Reasons the host can't start once the hardware is mapped.
#[derive(Debug)]
pub enum StartupError {
    Io(io::Error),
    Bus(BusError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StartupError::Io(ref e) => write!(f, "startup failed: {}", e),
            StartupError::Bus(ref e) => write!(f, "event bus: {}", e),
        }
    }
}

impl Error for StartupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            StartupError::Io(ref e) => Some(e),
            StartupError::Bus(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for StartupError {
    fn from(e: io::Error) -> Self { StartupError::Io(e) }
}

impl From<BusError> for StartupError {
    fn from(e: BusError) -> Self { StartupError::Bus(e) }
}

/// The FPGA plus the bus it announces started cores on.
struct Host<R> {
    fpga: Fpga<R>,
    bus: EventBus,
    root: PathBuf,
    id: ObserverId,
}

impl<R: RegisterIo> Host<R> {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_owned()
        } else {
            self.root.join(path)
        }
    }

    /// Loads a core with the core reset held, then lets it run and announces it.
    fn load_core(&mut self, path: &Path) {
        let path = self.resolve(path);
        info!("loading {}", path.display());

        self.fpga.core_reset(true);
        match self.fpga.load_bitstream(&path) {
            Ok(()) => {
                self.fpga.core_reset(false);
                let id = self.fpga.core_id();
                if id.is_none() {
                    warn!("{} doesn't identify itself", path.display());
                }
                let info = CoreInfo { path: path, id: id };
                if let Err(e) = self.bus.publish(EVENT_CORE_STARTED, self.id,
                                                 Payload::CoreStarted(info)) {
                    warn!("couldn't announce the core: {}", e);
                }
            }
            Err(e) => match e.class() {
                ErrorClass::HardwareTimeout => {
                    error!("loading {} failed: {} (the load can be retried)", path.display(), e)
                }
                _ => error!("can't load {}: {}", path.display(), e),
            },
        }
    }

    fn execute(&mut self, command: Command) {
        debug!("command {:?}", command);
        match command {
            Command::LoadCore(path) => self.load_core(&path),
            Command::ResetCore => {
                self.fpga.core_reset(true);
                self.fpga.core_reset(false);
            }
            Command::SetLed(on) => self.fpga.set_led(on),
            Command::CoreWrite { offset, value } => self.fpga.core_write(offset, value),
        }
    }
}

/// Starts the input side: devices present now, the poller and, if wanted, hot-plug detection.
fn start_input(bus: &EventBus, options: &Options, tasks: &mut Vec<Task>)
               -> Result<Arc<InputPoller>, StartupError> {
    let registry = Arc::new(DeviceRegistry::new(Box::new(EvdevOpener)));
    let poller = Arc::new(InputPoller::new(registry.clone(), bus.clone(),
                                           PollerConfig::default())?);

    for device in registry.detect_devices(&options.input_dir) {
        let path = device.path().to_owned();
        if let Err(e) = poller.add_device(device) {
            warn!("can't poll {}: {}", path.display(), e);
        }
    }
    info!("{} input devices", registry.len());

    InputPoller::attach(&poller)?;
    tasks.push(InputPoller::start(poller.clone())?);

    if options.hotplug {
        let config = DetectorConfig { dir: options.input_dir.clone(), ..DetectorConfig::default() };
        match DeviceDetector::with_inotify(bus.clone(), config) {
            Ok(detector) => tasks.push(detector.start()?),
            Err(e) => warn!("can't watch {}, hot-plugging disabled: {}",
                            options.input_dir.display(), e),
        }
    }

    Ok(poller)
}

/// Runs the host until SIGINT/SIGTERM.
pub fn run<R: RegisterIo>(fpga: Fpga<R>, options: Options) -> Result<(), StartupError> {
    let bus = EventBus::new(BusConfig {
        queue_capacity: options.queue_capacity,
        ..BusConfig::default()
    });
    let mut tasks = vec![bus.start()?];

    let poller = start_input(&bus, &options, &mut tasks)?;

    let menu = CoreListMenu::scan(&options.root).unwrap_or_else(|e| {
        warn!("can't list cores in {}: {}", options.root.display(), e);
        CoreListMenu::new(Vec::new())
    });
    let (commands, received) = mpsc::channel();
    let mut dispatcher = CommandDispatcher::new(Box::new(menu), Box::new(LogOsd::default()),
                                                commands);
    dispatcher.set_translator(Some((options.translator)()));
    let _dispatcher = dispatcher.attach(&bus)?;

    let mut host = Host {
        fpga: fpga,
        bus: bus.clone(),
        root: options.root.clone(),
        id: ObserverId::unique(),
    };
    if let Some(ref core) = options.core {
        host.load_core(core);
    }

    info!("ready");
    while !signal::received() {
        match received.recv_timeout(SIGNAL_CHECK) {
            Ok(command) => host.execute(command),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("shutting down");
    bus.close();
    poller.detach();
    for task in tasks.into_iter().rev() {
        task.stop();
    }
    Ok(())
}
