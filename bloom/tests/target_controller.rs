//! End-to-end tests driving the target controller against the simulator
//! tool, the way the protocol server drives it in production.

mod harness;

use std::time::Duration;

use pretty_assertions::assert_eq;

use bloom::error::{Error, ErrorKind};
use bloom::event::EventKind;
use bloom::target_controller::{Command, TargetControllerState};
use bloom::targets::{Breakpoint, BreakpointKind, GpioDirection, GpioPadState, GpioValue};
use bloom::EventPayload;
use bloom_target::AddressRange;

use harness::Harness;

const AVR_ENVIRONMENT: &str = r#"
tool:
  name: "simulator"
target:
  name: "atmega328p"
  physical_interface: "debug_wire"
"#;

fn sw_breakpoint(address: u32) -> Breakpoint {
    Breakpoint {
        address_space_key: "prog".to_owned(),
        memory_segment_key: "internal_program_memory".to_owned(),
        address,
        size: 2,
        kind: BreakpointKind::Software,
        original_data: None,
    }
}

#[test]
fn halt_read_registers_resume() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);

    // The target resumes on startup; consume the initial resume event.
    harness.expect_event(EventKind::TargetExecutionResumed);

    // Halt: the execution-stopped event must precede the success response.
    let command_id = harness.service.submit(Command::StopExecution);
    let response = harness.service.await_response(command_id, Some(Duration::from_secs(5))).unwrap();
    assert!(response.result.is_ok());

    let stop_event = harness.expect_event(EventKind::TargetExecutionStopped);
    assert!(response.posted_at >= stop_event.created_at);

    // Read SPL/SPH: the value array preserves descriptor count and order.
    let descriptor = harness.service.target_descriptor().unwrap();
    let cpu = descriptor.peripheral("cpu").unwrap().register_group("cpu").unwrap();
    let descriptors =
        vec![cpu.register("spl").unwrap().clone(), cpu.register("sph").unwrap().clone()];

    let values = harness.service.read_registers(descriptors.clone()).unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].descriptor.key, "spl");
    assert_eq!(values[1].descriptor.key, "sph");

    // Resume: the execution-resumed event must precede the success response.
    let command_id =
        harness.service.submit(Command::ResumeExecution { from_program_counter: None });
    let response = harness.service.await_response(command_id, Some(Duration::from_secs(5))).unwrap();
    assert!(response.result.is_ok());

    let resume_event = harness.expect_event(EventKind::TargetExecutionResumed);
    assert!(response.posted_at >= resume_event.created_at);

    harness.shutdown();
}

#[test]
fn software_breakpoint_round_trip() {
    let mut options = harness::options();
    options.initial_memory.push((
        "prog".to_owned(),
        "internal_program_memory".to_owned(),
        0x1000,
        vec![0x94, 0xAA],
    ));

    let harness = Harness::start(AVR_ENVIRONMENT, options);
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    harness.service.set_breakpoint(sw_breakpoint(0x1000)).unwrap();

    // The break instruction now sits where the original instruction was.
    let data = harness
        .service
        .read_memory("prog", "internal_program_memory", 0x1000, 2, Vec::new())
        .unwrap();
    assert_eq!(data, vec![0x98, 0x95]);

    harness.service.remove_breakpoint(sw_breakpoint(0x1000)).unwrap();

    let data = harness
        .service
        .read_memory("prog", "internal_program_memory", 0x1000, 2, Vec::new())
        .unwrap();
    assert_eq!(data, vec![0x94, 0xAA]);

    harness.shutdown();
}

#[test]
fn flash_writes_are_gated_on_programming_mode() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);

    let error = harness
        .service
        .write_memory("prog", "internal_program_memory", 0x200, vec![0x01, 0x02, 0x03, 0x04])
        .unwrap_err();
    assert!(matches!(error, Error::ProgrammingModeRequired(_)));

    harness.service.enable_programming_mode().unwrap();
    harness.expect_event(EventKind::ProgrammingModeEnabled);

    harness
        .service
        .write_memory("prog", "internal_program_memory", 0x200, vec![0x01, 0x02, 0x03, 0x04])
        .unwrap();
    harness.expect_event(EventKind::MemoryWritten);

    let data = harness
        .service
        .read_memory("prog", "internal_program_memory", 0x200, 4, Vec::new())
        .unwrap();
    assert_eq!(data, vec![0x01, 0x02, 0x03, 0x04]);

    harness.service.disable_programming_mode().unwrap();
    harness.expect_event(EventKind::ProgrammingModeDisabled);

    harness.shutdown();
}

#[test]
fn access_mode_gating_denies_forbidden_writes() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);

    // Lock bits are read-only whilst debugging, regardless of buffer length.
    let error =
        harness.service.write_memory("lockbits", "lockbits", 0x0, vec![0xFF]).unwrap_err();
    assert!(matches!(error, Error::AccessDenied(_)));

    harness.shutdown();
}

#[test]
fn out_of_segment_reads_are_rejected() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);

    // The flash segment ends at 0x7FFF; this read runs 16 bytes past it.
    let error = harness
        .service
        .read_memory("prog", "internal_program_memory", 0x7FF0, 32, Vec::new())
        .unwrap_err();
    assert!(matches!(error, Error::RangeViolation(_)));

    harness.shutdown();
}

#[test]
fn dwen_update_aborts_on_set_lock_bits() {
    let environment = r#"
tool:
  name: "simulator"
target:
  name: "atmega328p"
  physical_interface: "debug_wire"
  manage_dwen_fuse_bit: true
"#;

    let mut options = harness::options();
    // DWEN unprogrammed, so activation attempts ISP fuse recovery...
    options.initial_memory.push(("fuses".to_owned(), "fuses".to_owned(), 0x1, vec![0xD9]));
    // ...which must abort on the set lock bits.
    options.initial_memory.push(("lockbits".to_owned(), "lockbits".to_owned(), 0x0, vec![0xF3]));

    let harness = Harness::start(environment, options);

    // Startup fails and the controller shuts down.
    harness.wait_for_state(TargetControllerState::Stopped);

    // No fuse write appears on the probe transcript.
    let device = harness.device();
    let transcript = device.lock().unwrap().transcript().to_vec();
    assert!(
        !transcript.iter().any(|entry| entry.starts_with("isp.program_fuse")),
        "unexpected fuse write in transcript: {transcript:?}"
    );

    harness.join();
}

#[test]
fn suspension_round_trip() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);

    harness.device().lock().unwrap().fail_next_polls(1);
    harness.wait_for_state(TargetControllerState::Suspended);

    // Hardware commands are rejected whilst suspended.
    let error = harness.service.stop_execution().unwrap_err();
    assert_eq!(error.kind(), ErrorKind::UnknownCommand);

    // A new debug session triggers reacquisition.
    harness.bus.publish(EventPayload::StartDebugSession);
    harness.wait_for_state(TargetControllerState::Active);

    harness.service.stop_execution().unwrap();

    harness.shutdown();
}

#[test]
fn repeated_suspension_is_idempotent() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);

    harness.device().lock().unwrap().fail_next_polls(2);
    harness.wait_for_state(TargetControllerState::Suspended);

    // The second failed poll must not produce a second transition.
    std::thread::sleep(Duration::from_millis(300));
    assert!(harness
        .listener
        .wait_for(&[EventKind::TargetControllerStateChanged], Some(Duration::ZERO), None)
        .is_none());

    harness.bus.publish(EventPayload::StartDebugSession);
    harness.wait_for_state(TargetControllerState::Active);

    harness.shutdown();
}

#[test]
fn breakpoints_are_cleared_on_shutdown() {
    let mut options = harness::options();
    options.initial_memory.push((
        "prog".to_owned(),
        "internal_program_memory".to_owned(),
        0x10,
        vec![0x11, 0x22, 0x33, 0x44],
    ));

    let harness = Harness::start(AVR_ENVIRONMENT, options);
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    harness.service.set_breakpoint(sw_breakpoint(0x10)).unwrap();
    harness.service.set_breakpoint(sw_breakpoint(0x12)).unwrap();

    let device = harness.device();
    harness.shutdown();

    // Deactivation removed every ledger entry, restoring the original
    // instruction bytes.
    let data = device
        .lock()
        .unwrap()
        .read_memory("prog", "internal_program_memory", 0x10, 4)
        .unwrap();
    assert_eq!(data, vec![0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn excluded_ranges_are_zero_filled() {
    let mut options = harness::options();
    options.initial_memory.push((
        "data".to_owned(),
        "internal_ram".to_owned(),
        0x100,
        (1..=16u8).collect(),
    ));

    let harness = Harness::start(AVR_ENVIRONMENT, options);
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    let data = harness
        .service
        .read_memory(
            "data",
            "internal_ram",
            0x100,
            16,
            vec![AddressRange::new(0x104, 0x107)],
        )
        .unwrap();

    let mut expected: Vec<u8> = (1..=16).collect();
    expected[4..8].fill(0x00);
    assert_eq!(data, expected);

    harness.shutdown();
}

#[test]
fn memory_writes_covering_registers_publish_register_values() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    // 0x5D/0x5E hold SPL/SPH in the data space.
    harness.service.write_memory("data", "io", 0x5D, vec![0x34, 0x12]).unwrap();

    let event = harness.expect_event(EventKind::RegistersWritten);
    let EventPayload::RegistersWritten(values) = &event.payload else {
        panic!("unexpected payload");
    };

    let spl = values.iter().find(|value| value.descriptor.key == "spl").unwrap();
    let sph = values.iter().find(|value| value.descriptor.key == "sph").unwrap();
    assert_eq!(spl.value, vec![0x34]);
    assert_eq!(sph.value, vec![0x12]);

    harness.shutdown();
}

#[test]
fn step_reports_a_step_break_cause() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();
    harness.expect_event(EventKind::TargetExecutionStopped);

    harness.service.step_execution(Some(0x100)).unwrap();
    harness.expect_event(EventKind::TargetExecutionResumed);

    // The poll observes the completed step.
    let event = harness.expect_event(EventKind::TargetExecutionStopped);
    let EventPayload::TargetExecutionStopped { program_counter, cause } = &event.payload else {
        panic!("unexpected payload");
    };
    assert_eq!(*program_counter, 0x102);
    assert_eq!(*cause, bloom::targets::BreakCause::Step);

    harness.shutdown();
}

#[test]
fn breakpoint_hits_carry_a_breakpoint_cause() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);

    harness.service.stop_execution().unwrap();
    harness.expect_event(EventKind::TargetExecutionStopped);

    harness.service.set_breakpoint(sw_breakpoint(0x400)).unwrap();
    harness.service.resume_execution(None).unwrap();

    // The running program hits the breakpoint.
    harness.device().lock().unwrap().halt_at(0x400);

    let event = harness.expect_event(EventKind::TargetExecutionStopped);
    let EventPayload::TargetExecutionStopped { program_counter, cause } = &event.payload else {
        panic!("unexpected payload");
    };
    assert_eq!(*program_counter, 0x400);
    assert_eq!(*cause, bloom::targets::BreakCause::Breakpoint);

    harness.shutdown();
}

#[test]
fn hardware_breakpoint_slots_are_bounded() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    let hw_breakpoint = |address: u32| Breakpoint {
        address_space_key: "prog".to_owned(),
        memory_segment_key: "internal_program_memory".to_owned(),
        address,
        size: 2,
        kind: BreakpointKind::Hardware,
        original_data: None,
    };

    // The descriptor declares a single hardware comparator.
    harness.service.set_breakpoint(hw_breakpoint(0x100)).unwrap();
    let error = harness.service.set_breakpoint(hw_breakpoint(0x200)).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::BreakpointResourceExhausted);

    harness.shutdown();
}

#[test]
fn target_state_snapshots_are_consistent() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    let command_id = harness.service.submit(Command::GetTargetState);
    let response = harness.service.await_response(command_id, Some(Duration::from_secs(5))).unwrap();

    let bloom::ResponsePayload::TargetState { execution_state, mode, program_counter } =
        response.result.unwrap()
    else {
        panic!("unexpected payload");
    };

    assert_eq!(execution_state, bloom::targets::TargetExecutionState::Stopped);
    assert_eq!(mode, bloom::targets::TargetMode::Debugging);
    assert!(program_counter.is_some());

    harness.shutdown();
}

#[test]
fn gpio_pad_state_round_trip() {
    let harness = Harness::start(AVR_ENVIRONMENT, Default::default());
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    harness
        .service
        .set_gpio_state(3, GpioPadState { value: GpioValue::High, direction: GpioDirection::Output })
        .unwrap();

    let states = harness.service.gpio_states(vec![3]).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].0.key, "pb3");
    assert_eq!(
        states[0].1,
        GpioPadState { value: GpioValue::High, direction: GpioDirection::Output }
    );

    harness.shutdown();
}

#[test]
fn eeprom_survives_chip_erase_via_eesave_management() {
    let environment = r#"
tool:
  name: "simulator"
target:
  name: "atmega328p"
  physical_interface: "updi"
"#;

    let mut options = harness::options();
    options.initial_memory.push((
        "eeprom".to_owned(),
        "internal_eeprom".to_owned(),
        0x0,
        vec![0xDE, 0xAD],
    ));
    options.initial_memory.push((
        "prog".to_owned(),
        "internal_program_memory".to_owned(),
        0x0,
        vec![0x01, 0x02],
    ));

    let harness = Harness::start(environment, options);
    harness.wait_for_state(TargetControllerState::Active);

    harness.service.enable_programming_mode().unwrap();
    harness.service.erase_memory("prog", "internal_program_memory").unwrap();

    let device = harness.device();
    {
        let mut device = device.lock().unwrap();
        // Flash is blank, EEPROM survived.
        assert_eq!(
            device.read_memory("prog", "internal_program_memory", 0x0, 2).unwrap(),
            vec![0xFF, 0xFF]
        );
        assert_eq!(
            device.read_memory("eeprom", "internal_eeprom", 0x0, 2).unwrap(),
            vec![0xDE, 0xAD]
        );
    }

    harness.service.disable_programming_mode().unwrap();

    // Leaving the session restored the EESAVE fuse to its original value.
    let high_fuse = device.lock().unwrap().read_memory("fuses", "fuses", 0x1, 1).unwrap();
    assert_eq!(high_fuse, vec![0x99]);

    harness.shutdown();
}
