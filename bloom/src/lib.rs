//! Bloom is a debug server for embedded microcontrollers (AVR8 and WCH
//! RISC-V families). It mediates between a host debugger and a physical
//! debug probe: the debugger requests abstract operations - halt, step,
//! read/write registers and memory, insert breakpoints - and Bloom
//! translates them into concrete probe transactions over the target's
//! on-chip debug interface (debugWIRE, PDI, UPDI, JTAG, ISP, SDI).
//!
//! The heart of the crate is the [`target_controller::TargetController`]: a
//! long-lived component whose thread exclusively owns the debug tool and the
//! target adapter, serializes all access to them, drives the target's
//! execution state machine, mediates programming sessions (including fuse
//! management and delta programming) and publishes state transitions through
//! the typed [`event::EventBus`]. Protocol servers talk to it through
//! [`target_controller::CommandService`].

pub mod config;
pub mod error;
pub mod event;
pub mod signal_handler;
pub mod target_controller;
pub mod targets;
pub mod tools;

pub use crate::error::{Error, ErrorKind};
pub use crate::event::{Event, EventBus, EventKind, EventListener, EventPayload};
pub use crate::target_controller::{
    Command, CommandService, ResponsePayload, TargetController, TargetControllerState,
};
pub use crate::targets::{TargetRegistry, SharedTargetState};
pub use crate::tools::ToolRegistry;
