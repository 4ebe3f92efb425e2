//! End-to-end tests for the WCH RISC-V specifics: delta programming,
//! mapped-segment aliasing and boot-mode switching.

mod harness;

use pretty_assertions::assert_eq;

use bloom::event::EventKind;
use bloom::target_controller::{Command, TargetControllerState};
use bloom::targets::{GpioDirection, GpioPadState, GpioValue};
use bloom::EventPayload;

use harness::Harness;

const WCH_ENVIRONMENT: &str = r#"
tool:
  name: "simulator"
target:
  name: "ch32v003"
  physical_interface: "sdi"
"#;

const MAIN_FLASH_BASE: u32 = 0x0800_0000;
const BOOT_FLASH_BASE: u32 = 0x1FFF_F000;

#[test]
fn delta_programming_reproduces_the_incoming_buffer() {
    let mut options = harness::options();
    // Seed the flash with a known image, so most delta blocks match.
    options.initial_memory.push((
        "sys".to_owned(),
        "main_program".to_owned(),
        MAIN_FLASH_BASE,
        vec![0x55; 1024],
    ));

    let harness = Harness::start(WCH_ENVIRONMENT, options);
    harness.wait_for_state(TargetControllerState::Active);

    harness.service.enable_programming_mode().unwrap();

    // Two blocks' worth of changes in a kilobyte - a delta-friendly write.
    let mut incoming = vec![0x55u8; 1024];
    incoming[70] = 0xAA;
    incoming[800] = 0xBB;

    harness
        .service
        .write_memory("sys", "main_program", MAIN_FLASH_BASE, incoming.clone())
        .unwrap();

    let written = harness
        .device()
        .lock()
        .unwrap()
        .read_memory("sys", "main_program", MAIN_FLASH_BASE, 1024)
        .unwrap();
    assert_eq!(written, incoming);

    harness.service.disable_programming_mode().unwrap();
    harness.shutdown();
}

#[test]
fn fragmented_delta_sessions_fall_back_to_a_full_write() {
    let mut options = harness::options();
    options.initial_memory.push((
        "sys".to_owned(),
        "main_program".to_owned(),
        MAIN_FLASH_BASE,
        vec![0x55; 1024],
    ));

    let harness = Harness::start(WCH_ENVIRONMENT, options);
    harness.wait_for_state(TargetControllerState::Active);

    harness.service.enable_programming_mode().unwrap();

    // Seven scattered fragments - beyond the driver's veto threshold. The
    // full write proceeds and the post-write image still matches.
    let mut incoming = vec![0x55u8; 1024];
    for block in 0..7 {
        incoming[block * 128] = block as u8;
    }

    harness
        .service
        .write_memory("sys", "main_program", MAIN_FLASH_BASE, incoming.clone())
        .unwrap();

    let written = harness
        .device()
        .lock()
        .unwrap()
        .read_memory("sys", "main_program", MAIN_FLASH_BASE, 1024)
        .unwrap();
    assert_eq!(written, incoming);

    harness.shutdown();
}

#[test]
fn mapped_segment_accesses_are_de_aliased() {
    let mut options = harness::options();
    options.initial_memory.push((
        "sys".to_owned(),
        "main_program".to_owned(),
        MAIN_FLASH_BASE + 0x40,
        vec![0xCA, 0xFE],
    ));

    let harness = Harness::start(WCH_ENVIRONMENT, options);
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    // A read through the mapped segment resolves to the selected (main)
    // program segment.
    let data = harness
        .service
        .read_memory("sys", "mapped_program_memory", 0x40, 2, Vec::new())
        .unwrap();
    assert_eq!(data, vec![0xCA, 0xFE]);

    harness.shutdown();
}

#[test]
fn boot_mode_switch_updates_aliasing_and_de_aliases_the_program_counter() {
    let harness = Harness::start(WCH_ENVIRONMENT, harness::options());
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();
    harness.expect_event(EventKind::TargetExecutionStopped);

    let output =
        harness.service.invoke_passthrough_command(vec!["program_mode".to_owned()]).unwrap();
    assert!(output.contains("user mode"), "unexpected status output: {output}");

    let output = harness
        .service
        .invoke_passthrough_command(vec!["program_mode".to_owned(), "boot".to_owned()])
        .unwrap();
    assert!(output.contains("Boot mode has been enabled"));
    harness.expect_event(EventKind::TargetReset);

    let output =
        harness.service.invoke_passthrough_command(vec!["program_mode".to_owned()]).unwrap();
    assert!(output.contains("boot mode"), "unexpected status output: {output}");

    // The post-reset program counter sits in the mapped segment, which now
    // aliases the boot segment rather than the one selected for debugging -
    // the stop event reports the de-aliased address.
    let command_id = harness.service.submit(Command::StopExecution);
    harness.service.await_response(command_id, Some(std::time::Duration::from_secs(5))).unwrap();

    let event = harness.expect_event(EventKind::TargetExecutionStopped);
    let EventPayload::TargetExecutionStopped { program_counter, .. } = &event.payload else {
        panic!("unexpected payload");
    };
    assert_eq!(*program_counter, BOOT_FLASH_BASE);

    harness.shutdown();
}

#[test]
fn clock_gated_gpio_pads_report_no_state() {
    let harness = Harness::start(WCH_ENVIRONMENT, harness::options());
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    // The port A clock is disabled - no meaningful state for its pads.
    let states = harness.service.gpio_states(vec![2]).unwrap();
    assert!(states.is_empty());

    harness.shutdown();
}

#[test]
fn gpio_pad_state_round_trip_with_enabled_port_clock() {
    let mut options = harness::options();
    // Enable the port A peripheral clock (IOPAEN).
    options.initial_memory.push((
        "sys".to_owned(),
        "peripherals".to_owned(),
        0x4002_1018,
        vec![0x04, 0x00, 0x00, 0x00],
    ));

    let harness = Harness::start(WCH_ENVIRONMENT, options);
    harness.wait_for_state(TargetControllerState::Active);
    harness.service.stop_execution().unwrap();

    harness
        .service
        .set_gpio_state(2, GpioPadState { value: GpioValue::High, direction: GpioDirection::Output })
        .unwrap();

    let states = harness.service.gpio_states(vec![2]).unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].0.key, "pa2");
    assert_eq!(
        states[0].1,
        GpioPadState { value: GpioValue::High, direction: GpioDirection::Output }
    );

    harness.shutdown();
}
