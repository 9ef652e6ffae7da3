//! End-to-end lifecycle scenarios: hardware notifications, client reports
//! and kernel events flowing through the client bus into control requests.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

use modemd_core::client_bus::{self, ReaderState};
use modemd_core::config::ModemTopology;
use modemd_core::context::ControlRequest;
use modemd_core::event::EventBus;
use modemd_core::event::modem_ctrl::ModemCtrlHandler;
use modemd_core::monitor::{DeviceMonitor, MonitorDevices};
use modemd_core::props::{self, PropertyStore};
use modemd_core::state::ModemState;
use modemd_core::test_util::Harness;

fn subscribe(bus: &client_bus::ClientBus) -> UnixStream {
    let (ours, theirs) = UnixStream::pair().unwrap();
    bus.add_client(ours).unwrap();
    theirs
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 64];
    let n = (&theirs).read(&mut buf).unwrap();
    assert!(
        client_bus::message_text(&buf[..n]).starts_with("Modem State"),
        "first message is the state line"
    );
    theirs
}

fn read_message(client: &UnixStream) -> String {
    let mut buf = [0u8; 256];
    let n = (&*client).read(&mut buf).unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[test]
fn hardware_assert_with_reset_requests_prepare_reset_immediately() {
    let h = Harness::new();
    h.props.set(props::MODEM_RESET, "1");
    h.props.set(props::SAVE_DUMP, "0");
    h.ctx.state.set(ModemState::Alive);
    let bus = h.bus();
    let client = subscribe(&bus);

    let monitor = DeviceMonitor::with_devices(
        Arc::clone(&h.ctx),
        Arc::clone(&bus),
        MonitorDevices {
            assert: h.path("assert"),
            watchdog: None,
            alive: None,
        },
    );
    monitor.handle(b"Modem Assert: cp exception\0");

    assert_eq!(h.ctx.state.get(), ModemState::Assert);
    assert_eq!(
        h.props.get(props::CTL_STOP).as_deref(),
        Some(props::AUX_SERVICE),
        "aux service stop requested"
    );
    assert_eq!(h.control.try_recv(), Ok(ControlRequest::PrepareReset));
    assert!(read_message(&client).contains("Modem Assert"));
}

#[test]
fn blocked_report_with_dump_waits_for_dump_complete() {
    let h = Harness::new();
    h.props.set(props::MODEM_RESET, "1");
    h.props.set(props::SAVE_DUMP, "1");
    h.ctx.state.set(ModemState::Alive);
    let bus = h.bus();
    let first = subscribe(&bus);
    let second = subscribe(&bus);

    let mut reader = ReaderState::default();
    bus.on_client_message(&mut reader, b"Modem Blocked\0");

    assert!(reader.later_reset, "caller must wait for the dump");
    assert_eq!(h.ctx.state.get(), ModemState::Assert);
    assert_eq!(read_message(&first), client_bus::MODEM_BLOCKED);
    assert_eq!(read_message(&second), client_bus::MODEM_BLOCKED);
    assert_eq!(h.control.try_recv(), Ok(ControlRequest::ModemBlocked));
    assert!(h.control.try_recv().is_err(), "no reset before the dump");
}

#[test]
fn cp_crash_uevent_broadcasts_assert() {
    let h = Harness::with_config(|c| c.daemon.topology = ModemTopology::External);
    h.ctx.state.set(ModemState::Alive);
    let bus = h.bus();
    let client = subscribe(&bus);

    let events = EventBus::new(4, 1, 8).unwrap();
    ModemCtrlHandler::new(Arc::clone(&h.ctx), Arc::clone(&bus), Arc::new(h.loader()))
        .register(&events)
        .unwrap();
    assert!(events.receive(
        b"change@/devices/mcd\0ACTION=change\0SUBSYSTEM=modem_ctrl\0MODEM_STAT=5\0"
    ));

    assert_eq!(read_message(&client), "Modem Assert: Miniap Panic");
    assert_eq!(h.ctx.state.get(), ModemState::Assert);
}

#[test]
fn socket_client_drives_blocked_then_dump_complete() {
    let h = Harness::new();
    h.props.set(props::MODEM_RESET, "1");
    h.props.set(props::SAVE_DUMP, "1");
    h.ctx.state.set(ModemState::Alive);
    let bus = h.bus();
    let sock = h.path("modemd.sock");
    let listener = client_bus::bind(sock.to_str().unwrap()).unwrap();
    bus.start(listener).unwrap();

    let mut client = UnixStream::connect(&sock).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    assert_eq!(read_message(&client), "Modem State: Alive\0");

    client.write_all(b"Modem Blocked\0").unwrap();
    assert_eq!(read_message(&client), client_bus::MODEM_BLOCKED);
    assert_eq!(
        h.control.recv_timeout(Duration::from_secs(2)),
        Ok(ControlRequest::ModemBlocked)
    );

    client.write_all(b"SLOGMODEM DUMP COMPLETE\0").unwrap();
    assert_eq!(
        h.control.recv_timeout(Duration::from_secs(2)),
        Ok(ControlRequest::ModemReset)
    );
}
