//! End-to-end scenarios across the crates: pipe-backed input devices, the event bus, the
//! dispatcher and a simulated FPGA.

extern crate fpgahost_bus as bus;
extern crate fpgahost_hw as hw;
extern crate fpgahost_input as input;
extern crate fpgahost_ui as ui;
extern crate libc;

use bus::*;
use hw::{Fpga, FpgaConfig};
use hw::regs::gpi;
use hw::sim::SimRegs;
use input::codes::*;
use input::{Capabilities, DeviceId, DeviceOpener, DeviceRegistry, InputDevice, InputPoller};
use input::{PollerConfig, RawEvent};
use ui::{Command, CommandDispatcher};
use ui::dummy::{CallLog, DummyOsd};
use ui::menu::CoreListMenu;

use std::collections::HashMap;
use std::env;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

/// Opens devices announced with `plug` as non-blocking pipes.
#[derive(Clone, Default)]
struct PipeDevices {
    caps: Arc<Mutex<HashMap<PathBuf, Capabilities>>>,
    writers: Arc<Mutex<HashMap<PathBuf, File>>>,
}

impl PipeDevices {
    fn plug(&self, path: &str, caps: Capabilities) {
        self.caps.lock().unwrap().insert(path.into(), caps);
    }

    fn send(&self, path: &str, events: &[RawEvent]) {
        let bytes: Vec<u8> = events.iter().flat_map(|e| e.to_bytes()).collect();
        let mut writers = self.writers.lock().unwrap();
        writers.get_mut(Path::new(path)).unwrap().write_all(&bytes).unwrap();
    }
}

impl DeviceOpener for PipeDevices {
    fn open(&self, path: &Path) -> io::Result<InputDevice> {
        let caps = match self.caps.lock().unwrap().get(path) {
            Some(caps) => caps.clone(),
            None => return Err(io::Error::new(io::ErrorKind::NotFound, "not plugged")),
        };
        let mut fds = [0; 2];
        let (rd, wr) = unsafe {
            assert_eq!(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC), 0);
            (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1]))
        };
        self.writers.lock().unwrap().insert(path.to_path_buf(), wr);
        Ok(InputDevice::from_parts(rd, path, "pipe keyboard".to_owned(), DeviceId::default(), caps))
    }
}

fn keyboard() -> Capabilities {
    Capabilities::new(EventTypes::SYN | EventTypes::KEY | EventTypes::LED,
        Bits::with(KEY_MAX, &ALPHA_KEYS), Bits::with(LED_MAX, &[LED_CAPSL]))
}

fn key(code: u16, value: i32) -> RawEvent {
    RawEvent::new(EV_KEY, code, value)
}

struct Rig {
    devices: PipeDevices,
    bus: EventBus,
    poller: Arc<InputPoller>,
}

fn rig() -> Rig {
    let devices = PipeDevices::default();
    let registry = Arc::new(DeviceRegistry::new(Box::new(devices.clone())));
    let bus = EventBus::new(BusConfig::default());
    let poller = Arc::new(InputPoller::new(registry, bus.clone(), PollerConfig::default())
        .unwrap());
    InputPoller::attach(&poller).unwrap();
    Rig { devices: devices, bus: bus, poller: poller }
}

impl Rig {
    fn insert(&self, path: &str, caps: Capabilities) {
        self.devices.plug(path, caps);
        self.bus.publish(EVENT_DEVICE_INSERTED, ObserverId::anonymous(),
            Payload::DeviceInserted(path.into())).unwrap();
        self.bus.pump();
    }

    /// Polls until `expected` batches were published, then delivers them.
    fn poll(&self, expected: usize) {
        let mut published = 0;
        for _ in 0..100 {
            published += self.poller.poll_once().unwrap();
            if published >= expected {
                break;
            }
        }
        assert_eq!(published, expected);
        self.bus.pump();
    }
}

#[test]
fn inserted_keyboard_reports_key_press() {
    let rig = rig();
    assert!(rig.poller.registry().is_empty());

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        rig.bus.subscribe(EVENT_KEYBOARD, ObserverId::unique(), move |msg| {
            seen.lock().unwrap().push(msg.payload.batch().unwrap().clone());
        }).unwrap();
    }

    rig.insert("event3", keyboard());
    assert!(rig.poller.registry().find(Path::new("event3")).is_some());

    rig.devices.send("event3", &[key(KEY_A, 1), RawEvent::sync()]);
    rig.poll(1);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].events, vec![InputEvent::Key { code: 30, pressed: true }]);
}

#[test]
fn core_started_observers_in_subscription_order() {
    let bus = EventBus::new(BusConfig::default());
    let task = bus.start().unwrap();
    let (tx, rx) = mpsc::channel();
    for name in &["first", "second"] {
        let tx = Mutex::new(tx.clone());
        bus.subscribe(EVENT_CORE_STARTED, ObserverId::unique(), move |_| {
            tx.lock().unwrap().send(*name).unwrap();
        }).unwrap();
    }

    let info = CoreInfo { path: "menu.rbf".into(), id: None };
    bus.publish(EVENT_CORE_STARTED, ObserverId::anonymous(), Payload::CoreStarted(info))
        .unwrap();

    let timeout = Duration::from_secs(5);
    assert_eq!(rx.recv_timeout(timeout), Ok("first"));
    assert_eq!(rx.recv_timeout(timeout), Ok("second"));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    task.stop();
}

#[test]
fn menu_loads_core_from_keyboard() {
    let dir = env::temp_dir().join(format!("fpgahost-scenario-{}", process::id()));
    fs::create_dir_all(&dir).unwrap();
    let core = dir.join("snes.rbf");
    fs::write(&core, vec![0xA5; 4096]).unwrap();

    let rig = rig();
    let log = CallLog::default();
    let (commands, received) = mpsc::channel();
    let menu = CoreListMenu::scan(&dir).unwrap();
    let dispatcher = CommandDispatcher::new(Box::new(menu), Box::new(DummyOsd::new(log.clone())),
        commands).attach(&rig.bus).unwrap();

    rig.insert("event0", keyboard());
    rig.devices.send("event0", &[
        key(KEY_LEFTALT, 1), key(KEY_F12, 1), RawEvent::sync(),
        key(KEY_LEFTALT, 0), key(KEY_F12, 0), RawEvent::sync(),
        key(KEY_DOWN, 1), RawEvent::sync(),
        key(KEY_DOWN, 0), RawEvent::sync(),
        key(KEY_ENTER, 1), RawEvent::sync(),
    ]);
    rig.poll(5);
    assert!(dispatcher.lock().unwrap().menu_active());

    let got: Vec<Command> = received.try_iter().collect();
    assert_eq!(got, vec![Command::SetLed(true), Command::LoadCore(core.clone())]);

    // What the main loop does with it
    let mut fpga = Fpga::new(SimRegs::new(), FpgaConfig::default());
    fpga.set_led(true);
    fpga.core_reset(true);
    fpga.load_bitstream(&core).unwrap();
    fpga.core_reset(false);
    fpga.registers_mut().set_gpi(gpi::CORE_MAGIC << 8 | 0x42);
    let id = fpga.core_id();
    assert_eq!(id, Some(0x42));
    assert!(fpga.is_ready());
    assert_eq!(fpga.registers().data_bytes(), 4096);

    rig.bus.publish(EVENT_CORE_STARTED, ObserverId::anonymous(),
        Payload::CoreStarted(CoreInfo { path: core.clone(), id: id })).unwrap();
    rig.bus.pump();

    assert!(!dispatcher.lock().unwrap().menu_active());
    assert_eq!(log.calls(), vec!["show", "hide"]);
    assert_eq!(received.try_recv(), Ok(Command::SetLed(false)));

    fs::remove_dir_all(&dir).unwrap();
}
